use crate::error::ScanError;
use serde::{Deserialize, Serialize};

/// An inclusive TCP port range, defaulting to the well-known 1-1024 span.
///
/// Construction is unchecked so a range parsed from user input can be carried
/// around; [`PortRange::validate`] rejects unusable ranges before any probing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 1,
            end: 1024,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Parse `"80"` or `"1-1024"`. Whitespace around numbers is tolerated.
    pub fn parse(s: &str) -> Result<Self, ScanError> {
        let s = s.trim();
        let (a, b) = match s.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s, s),
        };
        let start = parse_port(a)?;
        let end = parse_port(b)?;
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Reject empty or out-of-range spans. Port 0 is not scannable.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.start == 0 {
            return Err(ScanError::Configuration(
                "port range must start at 1 or above".into(),
            ));
        }
        if self.start > self.end {
            return Err(ScanError::Configuration(format!(
                "invalid port range {}-{} (start > end)",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end) - u32::from(self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn parse_port(s: &str) -> Result<u16, ScanError> {
    let val: u32 = s
        .parse()
        .map_err(|_| ScanError::Configuration(format!("invalid port value: {s:?}")))?;
    if val == 0 || val > 65_535 {
        return Err(ScanError::Configuration(format!("port out of range: {val}")));
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_port() {
        let r = PortRange::parse("80").unwrap();
        assert_eq!((r.start, r.end), (80, 80));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn parse_range_with_whitespace() {
        let r = PortRange::parse(" 1 - 1024 ").unwrap();
        assert_eq!((r.start, r.end), (1, 1024));
        assert_eq!(r.len(), 1024);
    }

    #[test]
    fn inverted_range_rejected() {
        assert!(PortRange::parse("100-50").is_err());
        assert!(PortRange::new(100, 50).validate().is_err());
    }

    #[test]
    fn port_zero_rejected() {
        assert!(PortRange::parse("0").is_err());
        assert!(PortRange::parse("0-10").is_err());
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(PortRange::parse("70000").is_err());
        assert!(PortRange::parse("1-65536").is_err());
    }

    #[test]
    fn full_range_accepted() {
        let r = PortRange::parse("1-65535").unwrap();
        assert_eq!(r.len(), 65_535);
    }

    #[test]
    fn iter_covers_whole_span() {
        let r = PortRange::new(10, 13);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![10, 11, 12, 13]);
        assert!(r.contains(10) && r.contains(13) && !r.contains(14));
    }
}
