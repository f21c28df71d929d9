//! DHCP range sizing.
//!
//! Computes the effective host slot count for a network instance and
//! fills in the gateway and DHCP range when they have to be derived.
//! The range lives inside the subnet and excludes the network address,
//! broadcast address and gateway; the gateway defaults to the first
//! host address with the range starting right after it, e.g. subnet
//! 10.1.0.0/24 yields gateway 10.1.0.1 and range 10.1.0.2-10.1.0.254.
//! Whatever the subnet allows, the slot count never exceeds the app
//! number ceiling of 255.

use ipnet::{IpAdd, Ipv4Net};
use log::warn;

use crate::status::NetworkInstanceStatus;
use crate::types::APP_NUM_MAX;

/// Total address count of a subnet, network and broadcast included.
fn subnet_capacity(subnet: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(subnet.prefix_len()))
}

/// Apply the range sizing policy to `status` and return the number of
/// app number slots activation may allocate from. Ranges recomputed
/// here are written back so assignment always sees the effective range.
pub fn ensure_dhcp_range(status: &mut NetworkInstanceStatus) -> u16 {
    let size = range_size(status);
    status.dhcp_range.size = size;
    size
}

fn range_size(status: &mut NetworkInstanceStatus) -> u16 {
    let Some(subnet) = status.subnet else {
        // Address-agnostic instances rely purely on the bitmap's own
        // capacity limit
        return APP_NUM_MAX;
    };

    // An explicitly configured range wins if it is usable
    if let (Some(start), Some(end)) = (status.dhcp_range.start, status.dhcp_range.end) {
        if start <= end && subnet.contains(&start) && subnet.contains(&end) {
            let count = u64::from(u32::from(end) - u32::from(start)) + 1;
            let clamped = count.min(u64::from(APP_NUM_MAX)) as u16;
            if count >= subnet_capacity(&subnet) {
                // Range swallows the whole subnet: rebuild it behind a
                // first-host gateway
                let gateway = subnet.network().saturating_add(1);
                let range_start = gateway.saturating_add(1);
                let range_end = range_start.saturating_add(u32::from(clamped) - 1);
                warn!(
                    "{}: DHCP range {}-{} covers subnet {}, rewriting to {}-{}",
                    status.name, start, end, subnet, range_start, range_end
                );
                status.gateway = Some(gateway);
                status.dhcp_range.start = Some(range_start);
                status.dhcp_range.end = Some(range_end);
                return clamped;
            }
            if count > u64::from(APP_NUM_MAX) {
                warn!(
                    "{}: DHCP range holds {} hosts, clamping to {}",
                    status.name, count, APP_NUM_MAX
                );
            }
            return clamped;
        }
        warn!(
            "{}: ignoring unusable DHCP range {}-{} for subnet {}",
            status.name, start, end, subnet
        );
    }

    // Derive from the subnet, reserving the network address, broadcast
    // address and gateway
    let capacity = subnet_capacity(&subnet);
    if capacity >= 4 {
        let count = (capacity - 3).min(u64::from(APP_NUM_MAX)) as u16;
        let gateway = status
            .gateway
            .unwrap_or_else(|| subnet.network().saturating_add(1));
        let range_start = gateway.saturating_add(1);
        let range_end = range_start.saturating_add(u32::from(count) - 1);
        status.gateway = Some(gateway);
        status.dhcp_range.start = Some(range_start);
        status.dhcp_range.end = Some(range_end);
        return count;
    }

    APP_NUM_MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{DhcpRange, NetworkInstanceType};
    use crate::types::NetworkInstanceId;
    use std::net::Ipv4Addr;

    fn status(
        subnet: Option<&str>,
        gateway: Option<&str>,
        range: Option<(&str, &str)>,
    ) -> NetworkInstanceStatus {
        NetworkInstanceStatus::new(
            NetworkInstanceId::new_v4(),
            "test",
            NetworkInstanceType::Local,
            subnet.map(|s| s.parse().unwrap()),
            gateway.map(|g| g.parse().unwrap()),
            DhcpRange {
                start: range.map(|(s, _)| s.parse().unwrap()),
                end: range.map(|(_, e)| e.parse().unwrap()),
                size: 0,
            },
        )
    }

    #[test]
    fn test_subnet_only_derives_second_host_range() {
        let mut status = status(Some("10.1.0.0/24"), None, None);
        let size = ensure_dhcp_range(&mut status);
        assert_eq!(size, 253);
        assert_eq!(status.gateway, Some("10.1.0.1".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(
            status.dhcp_range.start,
            Some("10.1.0.2".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(
            status.dhcp_range.end,
            Some("10.1.0.254".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(status.dhcp_range.size, 253);
    }

    #[test]
    fn test_configured_range_is_used_as_is() {
        let mut status = status(
            Some("10.1.0.0/24"),
            Some("10.1.0.1"),
            Some(("10.1.0.2", "10.1.0.10")),
        );
        assert_eq!(ensure_dhcp_range(&mut status), 9);
        // The configured range is kept untouched
        assert_eq!(
            status.dhcp_range.start,
            Some("10.1.0.2".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(
            status.dhcp_range.end,
            Some("10.1.0.10".parse::<Ipv4Addr>().unwrap())
        );
    }

    #[test]
    fn test_oversized_configured_range_is_rewritten() {
        let mut status = status(
            Some("10.1.0.0/24"),
            None,
            Some(("10.1.0.0", "10.1.0.255")),
        );
        let size = ensure_dhcp_range(&mut status);
        assert_eq!(size, 255);
        assert_eq!(status.gateway, Some("10.1.0.1".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(
            status.dhcp_range.start,
            Some("10.1.0.2".parse::<Ipv4Addr>().unwrap())
        );
    }

    #[test]
    fn test_range_outside_subnet_falls_back_to_subnet() {
        let mut status = status(
            Some("10.1.0.0/24"),
            None,
            Some(("192.168.0.2", "192.168.0.10")),
        );
        assert_eq!(ensure_dhcp_range(&mut status), 253);
        assert_eq!(
            status.dhcp_range.start,
            Some("10.1.0.2".parse::<Ipv4Addr>().unwrap())
        );
    }

    #[test]
    fn test_large_subnet_clamps_to_app_num_ceiling() {
        let mut status = status(Some("10.0.0.0/16"), None, None);
        assert_eq!(ensure_dhcp_range(&mut status), 255);
    }

    #[test]
    fn test_missing_subnet_defaults_to_max() {
        let mut status = status(None, None, None);
        assert_eq!(ensure_dhcp_range(&mut status), 255);
        assert!(status.dhcp_range.start.is_none());
    }

    #[test]
    fn test_tiny_subnet() {
        let mut slash30 = status(Some("10.1.0.0/30"), None, None);
        assert_eq!(ensure_dhcp_range(&mut slash30), 1);
        // /31 has no room for gateway plus hosts
        let mut slash31 = status(Some("10.1.0.0/31"), None, None);
        assert_eq!(ensure_dhcp_range(&mut slash31), 255);
    }

    #[test]
    fn test_explicit_gateway_shifts_range() {
        let mut status = status(Some("10.1.0.0/24"), Some("10.1.0.10"), None);
        assert_eq!(ensure_dhcp_range(&mut status), 253);
        assert_eq!(
            status.dhcp_range.start,
            Some("10.1.0.11".parse::<Ipv4Addr>().unwrap())
        );
    }
}
