//! Connection parameter overrides through debugfs
//!
//! An intercepted create connection command never reaches the controller, so its timing
//! parameters would be lost. The kernel exposes the parameters it uses for the connections it
//! initiates under `/sys/kernel/debug/bluetooth/hci<N>/`, and writing there before the shadow
//! connect makes the kernel use the application's values.
//!
//! These writes are advisory. Debugfs may not be mounted or the files may not exist on older
//! kernels; a failed write is logged and the connection attempt proceeds with kernel defaults.

use crate::commands::ConnTimings;
use std::io;
use std::path::PathBuf;

const DEBUGFS_ROOT: &str = "/sys/kernel/debug/bluetooth";

fn parameter_path(dev_id: u16, parameter: &str) -> PathBuf {
    format!("{}/hci{}/{}", DEBUGFS_ROOT, dev_id, parameter).into()
}

fn write_parameter(dev_id: u16, parameter: &str, value: u16) -> io::Result<()> {
    std::fs::write(parameter_path(dev_id, parameter), format!("{}\n", value))
}

/// Override the connection timing parameters of a device
pub(crate) fn apply_conn_timings(dev_id: u16, timings: &ConnTimings) {
    let parameters = [
        ("conn_min_interval", timings.interval_min),
        ("conn_max_interval", timings.interval_max),
        ("conn_latency", timings.latency),
        ("supervision_timeout", timings.supervision_timeout),
    ];

    for (parameter, value) in parameters {
        if let Err(error) = write_parameter(dev_id, parameter, value) {
            log::warn!("failed to override {} on hci{}: {}", parameter, dev_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_paths_follow_the_debugfs_layout() {
        assert_eq!(
            parameter_path(0, "conn_min_interval"),
            PathBuf::from("/sys/kernel/debug/bluetooth/hci0/conn_min_interval")
        );

        assert_eq!(
            parameter_path(12, "supervision_timeout"),
            PathBuf::from("/sys/kernel/debug/bluetooth/hci12/supervision_timeout")
        );
    }
}
