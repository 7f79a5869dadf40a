//! Serial port access and payload tracing.

use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::config::{config as global_config, Parity, SerialSettings};
use crate::error::LinkError;

pub(crate) fn hex_dump(b: &[u8]) -> String {
    b.iter()
        .map(|x| format!("{x:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump of a payload at debug level, only when `AVLINK_LOG_PAYLOADS=1`.
pub(crate) fn maybe_log_payload(label: &str, device: &str, payload: &[u8]) {
    if global_config().log_payloads {
        log::debug!("[{device} {label}] {}", hex_dump(payload));
    }
}

/// Open the configured serial port for async I/O.
pub fn open_serial(settings: &SerialSettings) -> Result<SerialStream, LinkError> {
    settings.validate()?;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    let port = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open_native_async()
        .map_err(|e| {
            log::error!("open {} failed: {e}", settings.port);
            LinkError::Io(e.into())
        })?;
    log::info!("opened {} @{} baud", settings.port, settings.baud_rate);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_is_spaced_uppercase() {
        assert_eq!(hex_dump(&[0x02, 0xAB, 0x0d]), "02 AB 0D");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn open_rejects_unset_port_before_touching_hardware() {
        let err = open_serial(&SerialSettings::default()).expect_err("no port");
        assert!(matches!(err, LinkError::Config(_)));
    }
}
