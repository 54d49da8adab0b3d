// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI device name parsing.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A PCI device name in `bus:device.function[/nsid]` form, fields in hex.
/// The namespace ID defaults to 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PciName {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub nsid: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid pci device name (expected bus:device.function[/nsid], hex)")]
pub struct InvalidPciName;

impl PciName {
    /// The bus:device.function portion, the process-wide key for the open
    /// device table.
    pub fn bdf(&self) -> String {
        format!("{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciName {
    type Err = InvalidPciName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bdf, nsid) = match s.split_once('/') {
            Some((bdf, nsid)) => (
                bdf,
                u32::from_str_radix(nsid, 16).map_err(|_| InvalidPciName)?,
            ),
            None => (s, 1),
        };
        if nsid == 0 {
            return Err(InvalidPciName);
        }
        let (bus, rest) = bdf.split_once(':').ok_or(InvalidPciName)?;
        let (device, function) = rest.split_once('.').ok_or(InvalidPciName)?;
        if bus.is_empty() || bus.len() > 2 || device.is_empty() || device.len() > 2 {
            return Err(InvalidPciName);
        }
        let parsed = Self {
            bus: u8::from_str_radix(bus, 16).map_err(|_| InvalidPciName)?,
            device: u8::from_str_radix(device, 16).map_err(|_| InvalidPciName)?,
            function: u8::from_str_radix(function, 16).map_err(|_| InvalidPciName)?,
            nsid,
        };
        if parsed.device > 0x1f || parsed.function > 7 {
            return Err(InvalidPciName);
        }
        Ok(parsed)
    }
}

impl fmt::Display for PciName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nsid != 1 {
            write!(f, "{}/{:x}", self.bdf(), self.nsid)
        } else {
            f.pad(&self.bdf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bdf() {
        let name: PciName = "01:00.0".parse().unwrap();
        assert_eq!(
            name,
            PciName {
                bus: 1,
                device: 0,
                function: 0,
                nsid: 1
            }
        );
        assert_eq!(name.bdf(), "01:00.0");
    }

    #[test]
    fn parses_nsid_suffix() {
        let name: PciName = "3a:1f.7/2".parse().unwrap();
        assert_eq!(
            name,
            PciName {
                bus: 0x3a,
                device: 0x1f,
                function: 7,
                nsid: 2
            }
        );
        assert_eq!(name.to_string(), "3a:1f.7/2");
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "", "01", "01:00", "01.00.0", "01:00.8", "01:20.0", "zz:00.0", "01:00.0/", "01:00.0/0",
            "123:00.0",
        ] {
            assert_eq!(bad.parse::<PciName>(), Err(InvalidPciName), "{bad}");
        }
    }
}
