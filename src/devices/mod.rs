//! Concrete device drivers, selected by name from a device config.

pub mod extron;
pub mod nec;

use crate::error::LinkError;
use crate::protocol::Protocol;

/// Driver names accepted in the `driver` field of a device config.
pub const DRIVERS: [&str; 2] = [extron::DRIVER, nec::DRIVER];

pub fn protocol_for(driver: &str) -> Result<Protocol, LinkError> {
    match driver {
        extron::DRIVER => extron::protocol(),
        nec::DRIVER => nec::protocol(),
        other => Err(LinkError::Config(format!(
            "unknown driver {other:?} (known: {})",
            DRIVERS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Framing;

    #[test]
    fn drivers_resolve_by_name() {
        for name in DRIVERS {
            let p = protocol_for(name).expect("known driver");
            assert_eq!(p.name(), name);
        }
        assert_eq!(
            protocol_for(nec::DRIVER).expect("nec").framing(),
            Framing::Binary
        );
        assert!(matches!(protocol_for("sony_vpl"), Err(LinkError::Config(_))));
    }
}
