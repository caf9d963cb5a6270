//! U-Boot + embedded Linux board.
//!
//! The console shows U-Boot's `=> ` prompt in the bootloader, then a getty
//! `<host> login: ` prompt, then a root shell `root@<host>:<cwd># `. The
//! kernel reports each network interface with `<iface>: link becomes ready`.

use crate::channel::PromptShapes;
use crate::platform::{BoardProfile, Credentials};

/// Interfaces whose readiness is awaited after boot.
pub const MONITORED_LINKS: [&str; 3] = ["eth0", "wlan0", "usb0"];

/// Create the profile for a board with the given hostname.
pub fn profile(hostname: &str, credentials: Credentials) -> Result<BoardProfile, regex::Error> {
    let mut profile = BoardProfile::new("uboot_linux", PromptShapes::for_host(hostname)?)
        .with_credentials(credentials);

    for interface in MONITORED_LINKS {
        profile = profile.with_link(interface, &format!(r"{interface}: link becomes ready"))?;
    }
    Ok(profile)
}
