//! Interface attribute probes (index, MTU, MAC, primary IPv4) and ARP cache
//! lookup, via the classic SIOCGIF*/SIOCGARP ioctls.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::{Result, TapError};

const IFNAMSIZ: usize = 16;
/// ATF_COM from <net/if_arp.h>: ARP entry has a completed lookup.
const ATF_COM: libc::c_int = 0x02;
/// SIOCGARP from <linux/sockios.h>.
const SIOCGARP: libc::c_ulong = 0x8954;

/// struct ifreq with the union viewed as raw bytes; each probe interprets
/// the bytes for the ioctl it issues, the way C code reads the union arms.
#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    data: [u8; 24],
}

impl IfReq {
    fn new(ifname: &str) -> Result<Self> {
        if ifname.len() >= IFNAMSIZ {
            return Err(TapError::InterfaceNotFound(ifname.to_string()));
        }
        let mut req = IfReq { name: [0; IFNAMSIZ], data: [0; 24] };
        req.name[..ifname.len()].copy_from_slice(ifname.as_bytes());
        Ok(req)
    }
}

/// struct arpreq from <net/if_arp.h>.
#[repr(C)]
struct ArpReq {
    arp_pa: libc::sockaddr_in,
    arp_ha: libc::sockaddr,
    arp_flags: libc::c_int,
    arp_netmask: libc::sockaddr,
    arp_dev: [u8; IFNAMSIZ],
}

fn dgram_socket() -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(TapError::Io(std::io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl_ifreq(op: &'static str, iface: &str, cmd: libc::c_ulong, req: &mut IfReq) -> Result<()> {
    let fd = dgram_socket()?;
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), cmd, req as *mut IfReq) };
    if rc != 0 {
        return Err(TapError::Iface {
            op,
            iface: iface.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Resolve an interface name to its index.
pub fn ifindex(ifname: &str) -> Result<u32> {
    let c = CString::new(ifname)
        .map_err(|_| TapError::InterfaceNotFound(ifname.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(c.as_ptr()) };
    if idx == 0 {
        return Err(TapError::InterfaceNotFound(ifname.to_string()));
    }
    Ok(idx)
}

/// Interface MTU (L3 bytes, Ethernet header not included).
pub fn mtu(ifname: &str) -> Result<u32> {
    let mut req = IfReq::new(ifname)?;
    ioctl_ifreq("SIOCGIFMTU", ifname, libc::SIOCGIFMTU, &mut req)?;
    let mtu = i32::from_ne_bytes([req.data[0], req.data[1], req.data[2], req.data[3]]);
    Ok(mtu.max(0) as u32)
}

/// Interface hardware (MAC) address.
pub fn mac(ifname: &str) -> Result<[u8; 6]> {
    let mut req = IfReq::new(ifname)?;
    ioctl_ifreq("SIOCGIFHWADDR", ifname, libc::SIOCGIFHWADDR, &mut req)?;
    // data holds a sockaddr: sa_family u16, then sa_data
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&req.data[2..8]);
    Ok(mac)
}

/// Primary IPv4 address of the interface.
pub fn ipv4_addr(ifname: &str) -> Result<Ipv4Addr> {
    let mut req = IfReq::new(ifname)?;
    ioctl_ifreq("SIOCGIFADDR", ifname, libc::SIOCGIFADDR, &mut req)?;
    // data holds a sockaddr_in: family u16, port u16, addr u32
    Ok(Ipv4Addr::new(req.data[4], req.data[5], req.data[6], req.data[7]))
}

/// Look up `ip` in the kernel ARP cache for `ifname`.
/// Returns the MAC when a completed entry exists.
pub fn arp_lookup(ifname: &str, ip: Ipv4Addr) -> Result<Option<[u8; 6]>> {
    if ifname.len() >= IFNAMSIZ {
        return Err(TapError::InterfaceNotFound(ifname.to_string()));
    }

    let mut req: ArpReq = unsafe { std::mem::zeroed() };
    req.arp_pa.sin_family = libc::AF_INET as libc::sa_family_t;
    req.arp_pa.sin_addr.s_addr = u32::from(ip).to_be();
    req.arp_ha.sa_family = libc::ARPHRD_ETHER;
    req.arp_dev[..ifname.len()].copy_from_slice(ifname.as_bytes());

    let fd = dgram_socket()?;
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCGARP, &mut req as *mut ArpReq) };
    if rc != 0 {
        // ENXIO/ENODEV: no entry yet; not an error for a cache probe
        return Ok(None);
    }
    if req.arp_flags & ATF_COM == 0 {
        return Ok(None);
    }
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(req.arp_ha.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(Some(mac))
}
