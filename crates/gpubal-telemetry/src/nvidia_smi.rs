//! `nvidia-smi` backed telemetry source
//!
//! Each query spawns `nvidia-smi` as a child process. The child is killed if
//! the caller's timeout drops the future.

use async_trait::async_trait;
use gpubal_core::{BalanceError, BalanceResult, DeviceId, DeviceReading};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::source::TelemetrySource;

const GPU_QUERY: &str = "index,name,utilization.gpu,memory.used,memory.total,temperature.gpu";

/// Telemetry source that shells out to `nvidia-smi`
pub struct NvidiaSmiSource {
    binary: PathBuf,
}

impl Default for NvidiaSmiSource {
    fn default() -> Self {
        Self::new(PathBuf::from("nvidia-smi"))
    }
}

impl NvidiaSmiSource {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn query(&self, args: &[String]) -> Result<String, String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.binary.display(), e))?;

        if !output.status.success() {
            return Err(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse one `--query-gpu` CSV line (noheader, nounits)
pub fn parse_gpu_line(line: &str) -> Result<DeviceReading, String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(format!("expected 6 columns, got {}: '{}'", parts.len(), line));
    }

    fn number<T: std::str::FromStr>(column: &str, raw: &str) -> Result<T, String> {
        raw.parse()
            .map_err(|_| format!("unparseable {} value '{}'", column, raw))
    }

    Ok(DeviceReading {
        device_id: number("index", parts[0])?,
        name: parts[1].to_string(),
        util_pct: number("utilization.gpu", parts[2])?,
        mem_used_mb: number("memory.used", parts[3])?,
        mem_total_mb: number("memory.total", parts[4])?,
        // Some boards report [N/A] for temperature
        temp_c: parts[5].parse().unwrap_or(0),
        process_count: 0,
    })
}

#[async_trait]
impl TelemetrySource for NvidiaSmiSource {
    async fn device_ids(&self) -> BalanceResult<Vec<DeviceId>> {
        let stdout = self
            .query(&[
                "--query-gpu=index".to_string(),
                "--format=csv,noheader,nounits".to_string(),
            ])
            .await
            .map_err(|e| BalanceError::Internal(format!("device enumeration failed: {}", e)))?;

        stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse()
                    .map_err(|_| BalanceError::Internal(format!("bad device index '{}'", l)))
            })
            .collect()
    }

    async fn read(&self, id: DeviceId) -> BalanceResult<DeviceReading> {
        let stdout = self
            .query(&[
                format!("--query-gpu={}", GPU_QUERY),
                "--format=csv,noheader,nounits".to_string(),
                "-i".to_string(),
                id.to_string(),
            ])
            .await
            .map_err(|e| BalanceError::telemetry(id, e))?;

        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| BalanceError::telemetry(id, "empty nvidia-smi output"))?;
        let mut reading = parse_gpu_line(line).map_err(|e| BalanceError::telemetry(id, e))?;

        let apps = self
            .query(&[
                "--query-compute-apps=pid".to_string(),
                "--format=csv,noheader".to_string(),
                "-i".to_string(),
                id.to_string(),
            ])
            .await
            .map_err(|e| BalanceError::telemetry(id, e))?;
        reading.process_count = apps.lines().filter(|l| !l.trim().is_empty()).count() as u32;

        debug!(
            device = id,
            util_pct = reading.util_pct,
            mem_used_mb = reading.mem_used_mb,
            "Read device"
        );
        Ok(reading)
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_line() {
        let reading =
            parse_gpu_line("1, NVIDIA GeForce RTX 4090, 37, 8123, 24564, 61").unwrap();
        assert_eq!(reading.device_id, 1);
        assert_eq!(reading.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(reading.util_pct, 37.0);
        assert_eq!(reading.mem_used_mb, 8123);
        assert_eq!(reading.mem_total_mb, 24564);
        assert_eq!(reading.temp_c, 61);
    }

    #[test]
    fn test_parse_missing_temperature() {
        let reading = parse_gpu_line("0, Tesla T4, 0, 0, 15360, [N/A]").unwrap();
        assert_eq!(reading.temp_c, 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_gpu_line("0, Tesla T4, [N/A], 0, 15360, 40").is_err());
        assert!(parse_gpu_line("0, Tesla T4").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_per_device_error() {
        let source = NvidiaSmiSource::new(PathBuf::from("/nonexistent/nvidia-smi"));
        let err = source.read(0).await.unwrap_err();
        assert!(matches!(err, BalanceError::TelemetryUnavailable { device: 0, .. }));
        assert!(source.device_ids().await.is_err());
        assert_eq!(source.name(), "nvidia-smi");
    }
}
