//! IPv4 interface enumeration (component C3's `EnumerateInterfaces`).
//!
//! `original_source/ClientNetwork.cpp::EnumerateInterfaces` walks
//! `SIOCGIFCONF`; the idiomatic POSIX equivalent is `getifaddrs(3)`, used
//! here the way `dspeyrer-net`'s runtime crate reaches for raw `libc`
//! socket calls rather than a higher-level networking crate.

use std::ffi::CStr;
use std::net::Ipv4Addr;
use std::ptr;

use ipnet::Ipv4Net;
use tracing::warn;

use crate::error::DnsProxyError;

/// Lists every up, non-loopback IPv4 address bound to a local interface,
/// excluding any address matched by `exclude` (spec.md's `NetFilter` list).
pub fn enumerate_ipv4(exclude: &[Ipv4Net]) -> Result<Vec<Ipv4Addr>, DnsProxyError> {
    let mut head: *mut libc::ifaddrs = ptr::null_mut();
    let ret = unsafe { libc::getifaddrs(&mut head) };
    if ret != 0 {
        return Err(DnsProxyError::SocketError(std::io::Error::last_os_error()));
    }

    let mut found = Vec::new();
    let mut cursor = head;

    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if family as i32 != libc::AF_INET {
            continue;
        }
        if entry.ifa_flags & (libc::IFF_UP as u32) == 0 {
            continue;
        }

        let sockaddr_in = entry.ifa_addr as *const libc::sockaddr_in;
        let raw_addr = unsafe { (*sockaddr_in).sin_addr.s_addr };
        let addr = Ipv4Addr::from(u32::from_be(raw_addr));

        if addr.is_loopback() || addr.is_unspecified() {
            continue;
        }
        if exclude.iter().any(|net| net.contains(&addr)) {
            continue;
        }

        let name = unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy().into_owned();
        if !found.contains(&addr) {
            found.push(addr);
        } else {
            warn!(%name, %addr, "duplicate interface address, skipping");
        }
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_loopback_by_default() {
        let found = enumerate_ipv4(&[]).expect("getifaddrs should succeed in test sandbox");
        assert!(!found.iter().any(|a| a.is_loopback()));
    }

    #[test]
    fn exclusion_list_filters_matching_nets() {
        let everything: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        let found = enumerate_ipv4(&[everything]).unwrap();
        assert!(found.is_empty());
    }
}
