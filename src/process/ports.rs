//! Port allocation from the configured ancillary range

use std::net::{Ipv4Addr, TcpListener};

use rand::Rng;

use super::LaunchError;

/// Find a port in `start..=end` that can currently be bound on loopback.
///
/// The search starts at a random offset so concurrent supervisors sharing a
/// range rarely collide.
pub fn allocate(start: u16, end: u16) -> Result<u16, LaunchError> {
    if start > end {
        return Err(LaunchError::NoFreePort { start, end });
    }

    let span = u32::from(end - start) + 1;
    let offset = rand::thread_rng().gen_range(0..span);

    for i in 0..span {
        let port = start as u32 + (offset + i) % span;
        let port = port as u16;
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return Ok(port);
        }
    }

    Err(LaunchError::NoFreePort { start, end })
}
