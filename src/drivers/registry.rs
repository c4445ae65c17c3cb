//! Driver registry (§9 "Polymorphism over drivers"): maps a normalized
//! driver-prefix to a constructor, grounded in DrMem's `driver::API`
//! registration pattern but expressed as a plain dispatch table since this
//! core has no plugin-loading requirement.

use crate::config::AuthLookup;
use crate::driver::{normalize_prefix, Driver};
use crate::drivers::{
    barcode_serial::BarcodeSerialDriver, file::FileDriver, libnfc::LibnfcMode,
    libnfc::LibnfcDriver, mqtt::MqttDriver, pcsc::PcscDriver, pn532::Pn532Driver,
    simple_serial::SimpleSerialDriver, udp_proxy::UdpProxyDriver,
};

/// Constructs every driver this core ships with, keyed by each of its
/// accepted (already-normalized) id strings. Legacy aliases resolve to the
/// same constructor as their canonical name; the libnfc modes are kept as
/// distinct instances with disjoint id lists per §9.
pub fn build_all(auth_lookup: Option<AuthLookup>) -> Vec<Box<dyn Driver>> {
    vec![
        Box::new(PcscDriver::new()),
        Box::new(LibnfcDriver::new(LibnfcMode::All)),
        Box::new(LibnfcDriver::new(LibnfcMode::Acr122Only)),
        Box::new(LibnfcDriver::new(LibnfcMode::LegacyUart)),
        Box::new(LibnfcDriver::new(LibnfcMode::LegacyI2c)),
        Box::new(Pn532Driver::new()),
        Box::new(BarcodeSerialDriver::new()),
        Box::new(SimpleSerialDriver::new()),
        Box::new(FileDriver::new()),
        Box::new(MqttDriver::new(auth_lookup)),
        Box::new(UdpProxyDriver::new()),
    ]
}

/// Finds the driver among `drivers` whose `ids()` accept `prefix`, after
/// underscore/case normalization.
pub fn find_by_prefix<'a>(
    drivers: &'a [Box<dyn Driver>],
    prefix: &str,
) -> Option<&'a dyn Driver> {
    let norm = normalize_prefix(prefix);
    drivers
        .iter()
        .find(|d| d.ids().iter().any(|id| normalize_prefix(id) == norm))
        .map(|d| d.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_entry_per_driver_family() {
        let drivers = build_all(None);
        assert!(drivers.len() >= 9);
    }

    #[test]
    fn finds_driver_by_normalized_prefix() {
        let drivers = build_all(None);
        assert!(find_by_prefix(&drivers, "simple_serial").is_some());
        assert!(find_by_prefix(&drivers, "simpleserial").is_some());
        assert!(find_by_prefix(&drivers, "nonexistent").is_none());
    }

    #[test]
    fn libnfc_modes_are_distinct_entries() {
        let drivers = build_all(None);
        assert!(find_by_prefix(&drivers, "libnfc").is_some());
        assert!(find_by_prefix(&drivers, "legacypn532uart").is_some());
        assert!(find_by_prefix(&drivers, "legacypn532i2c").is_some());
    }
}
