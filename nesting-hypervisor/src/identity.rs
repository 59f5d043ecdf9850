//! VM identity generation.

use std::fmt;

use rand::Rng;

/// Length of the random part of a VM id.
pub const UNIQUE_ID_LEN: usize = 8;

/// Prefix of every VM name nesting creates. Listing filters on it so VMs
/// owned by someone else on the host are never reported or touched.
pub const VM_NAME_PREFIX: &str = "nesting-";

const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a short random lowercase alphanumeric id.
pub fn unique_id() -> String {
    let mut rng = rand::thread_rng();
    (0..UNIQUE_ID_LEN)
        .map(|_| ALPHANUM[rng.gen_range(0..ALPHANUM.len())] as char)
        .collect()
}

/// A fresh VM id: [`VM_NAME_PREFIX`] followed by [`unique_id`].
pub fn vm_id() -> String {
    format!("{}{}", VM_NAME_PREFIX, unique_id())
}

/// A link-layer address for a VM NIC.
///
/// Generated addresses are always unicast and locally administered, so they
/// cannot collide with vendor-assigned hardware on the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Generate a random unicast, locally administered address.
    pub fn random() -> Self {
        let mut bytes: [u8; 6] = rand::random();
        // Set the locally administered bit, clear the multicast bit.
        bytes[0] = (bytes[0] | 0x02) & 0xfe;
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    /// Lowercase hex without separators (`02a1b2c3d4e5`).
    ///
    /// This is the form the Parallels tooling accepts and the key of its
    /// DHCP lease files.
    pub fn to_compact(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}
