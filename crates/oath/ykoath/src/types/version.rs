use derive_more::{Display, From, Into};

/// OATH applet firmware version (major.minor.patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("{}.{}.{}", major, minor, patch)]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Patch level
    pub patch: u8,
}

impl Version {
    /// Decode the value of the SELECT version record
    ///
    /// Anything but exactly three bytes is not a version.
    pub const fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [major, minor, patch] => Some(Self {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_bytes() {
        let version = Version::from_bytes(&[4, 2, 1]).unwrap();
        assert_eq!(version.to_string(), "4.2.1");
        assert!(version > Version::from((4, 1, 9)));
        assert_eq!(Version::from_bytes(&[5, 4]), None);
        assert_eq!(Version::from_bytes(&[]), None);
    }
}
