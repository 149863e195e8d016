use std::{
    fmt,
    str::FromStr,
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::{Mutex, const_mutex};

use crate::error::{Error, Result};

const OID_SIZE: usize = 12;
const TIME: usize = 0;
const MACHINE: usize = 4;
const PID: usize = 7;
const COUNTER: usize = 9;

/// Wraps at 24 bits; shared by every identifier generated in this process.
static INCREMENT: Mutex<u32> = const_mutex(0);

/// First three bytes of the MD5 of this host's name.
static MACHINE_BYTES: LazyLock<[u8; 3]> = LazyLock::new(|| {
    let digest = Md5::digest(hostname().as_bytes());
    [digest[0], digest[1], digest[2]]
});

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// 12-byte document identifier: creation time, host fingerprint, process id and a
/// process-wide counter. Ordering is byte-wise, so identifiers created later by the same
/// process sort after earlier ones.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OID_SIZE]);

impl ObjectId {
    /// Generates a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        let mut bytes = [0; OID_SIZE];
        bytes[TIME..MACHINE].copy_from_slice(&seconds.to_be_bytes());
        bytes[MACHINE..PID].copy_from_slice(&*MACHINE_BYTES);
        bytes[PID..COUNTER].copy_from_slice(&((std::process::id() % 0xFFFF) as u16).to_be_bytes());

        let counter = {
            let mut increment = INCREMENT.lock();
            let current = *increment;
            *increment = (current + 1) % 0x00FF_FFFF;
            current
        };
        bytes[COUNTER..].copy_from_slice(&counter.to_be_bytes()[1..]);

        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; OID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds an identifier from its 12-byte binary form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; OID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("{bytes:?} is not 12 bytes long")))?;
        Ok(Self(bytes))
    }

    /// Parses the 24 character hexadecimal form.
    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != OID_SIZE * 2 {
            return Err(Error::InvalidId(format!(
                "{s:?} is not a valid ObjectId, it must be a 24-character hex string"
            )));
        }
        let bytes = hex::decode(s).map_err(|_| {
            Error::InvalidId(format!("{s:?} is not a valid ObjectId, it contains non-hex characters"))
        })?;
        Self::from_slice(&bytes)
    }

    /// Identifier with the given creation time and every other byte zeroed. Only useful
    /// as a range bound in queries.
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let mut bytes = [0; OID_SIZE];
        bytes[TIME..MACHINE].copy_from_slice(&(time.timestamp() as u32).to_be_bytes());
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; OID_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time encoded in the first four bytes.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let seconds = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        DateTime::from_timestamp(i64::from(seconds), 0).unwrap_or_default()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::from_slice(value)
    }
}
