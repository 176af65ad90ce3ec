//! VMDK text descriptor parsing and rendering.
//!
//! The descriptor is the line-oriented text block embedded after the sparse
//! header. Parsing is lenient: unknown keys and malformed lines are skipped,
//! and only I/O failures are reported.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::str::FromStr;

use crate::error::{Error, Result};

use super::layout::SECTOR_SIZE;

/// Prefix of disk database keys.
const DDB_PREFIX: &str = "ddb.";

/// Access mode of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    #[default]
    ReadWrite,
    /// No access.
    NoAccess,
}

impl Permission {
    /// The keyword used in extent lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadOnly => "RDONLY",
            Permission::ReadWrite => "RW",
            Permission::NoAccess => "NOACCESS",
        }
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RDONLY" => Ok(Permission::ReadOnly),
            "RW" => Ok(Permission::ReadWrite),
            "NOACCESS" => Ok(Permission::NoAccess),
            _ => Err(Error::vmdk(format!("unknown extent permission: {}", s))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 32-bit content identifier, rendered as 8 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ContentId(pub u32);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    /// Parses the leading run of hex digits, ignoring anything after it.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let end = digits
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(digits.len());
        u32::from_str_radix(&digits[..end], 16)
            .map(ContentId)
            .map_err(|_| Error::vmdk(format!("invalid content id: {}", s)))
    }
}

/// A VMDK extent entry describing a portion of the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Access mode.
    pub permission: Permission,
    /// Size of this extent in 512-byte sectors.
    pub size: u64,
    /// Extent type keyword (e.g. "SPARSE", "FLAT", "VMFS").
    pub extent_type: String,
    /// Free-form info, usually the backing file name.
    pub info: String,
    /// Start sector inside the backing file, when given.
    pub offset: Option<u64>,
}

impl Extent {
    /// Creates a read-write extent without an offset.
    pub fn new(size: u64, extent_type: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            permission: Permission::ReadWrite,
            size,
            extent_type: extent_type.into(),
            info: info.into(),
            offset: None,
        }
    }

    /// Size of this extent in bytes, saturating at `u64::MAX`.
    pub fn size_bytes(&self) -> u64 {
        self.size.saturating_mul(SECTOR_SIZE)
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self::new(0, "VMFS", "")
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} \"{}\"",
            self.permission, self.size, self.extent_type, self.info
        )?;
        if let Some(offset) = self.offset {
            write!(f, " {}", offset)?;
        }
        Ok(())
    }
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Character encoding of the descriptor.
    pub encoding: String,
    /// Descriptor format version.
    pub version: i32,
    /// Content ID for change tracking.
    pub cid: ContentId,
    /// Parent content ID for delta disks.
    pub parent_cid: ContentId,
    /// The create type (e.g. "streamOptimized", "monolithicFlat").
    pub create_type: String,
    /// Extent entries in file order.
    pub extents: Vec<Extent>,
    /// Disk database entries, keyed without the `ddb.` prefix.
    pub ddb: BTreeMap<String, String>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            encoding: "UTF-8".to_string(),
            version: 1,
            cid: ContentId::default(),
            parent_cid: ContentId::default(),
            create_type: "vmfs".to_string(),
            extents: Vec::new(),
            ddb: BTreeMap::new(),
        }
    }
}

impl Descriptor {
    /// Creates a descriptor with default header values and the given extents.
    pub fn new(extents: Vec<Extent>) -> Self {
        Self {
            extents,
            ..Self::default()
        }
    }

    /// Total disk size in bytes, saturating at `u64::MAX`.
    pub fn capacity(&self) -> u64 {
        self.extents
            .iter()
            .map(Extent::size_bytes)
            .fold(0, u64::saturating_add)
    }

    /// Writes the descriptor text to `w`.
    pub fn render<W: Write>(&self, mut w: W) -> Result<()> {
        write!(w, "{}", self).map_err(Error::io_simple)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Disk DescriptorFile")?;
        writeln!(f, "version={}", self.version)?;
        writeln!(f, "encoding=\"{}\"", self.encoding)?;
        writeln!(f, "CID={}", self.cid)?;
        writeln!(f, "parentCID={}", self.parent_cid)?;
        writeln!(f, "createType=\"{}\"", self.create_type)?;
        writeln!(f)?;
        writeln!(f, "# Extent description")?;
        writeln!(f, "# Capacity: {}", format_bytes(self.capacity()))?;
        for extent in &self.extents {
            writeln!(f, "{}", extent)?;
        }
        writeln!(f)?;
        writeln!(f, "# The Disk Data Base")?;
        writeln!(f, "#DDB")?;
        for (key, value) in &self.ddb {
            writeln!(f, "{}{} = \"{}\"", DDB_PREFIX, key, value)?;
        }
        Ok(())
    }
}

impl FromStr for Descriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_descriptor(s.as_bytes())
    }
}

/// Parse a VMDK descriptor from a reader.
///
/// Lines are trimmed of whitespace and NUL padding. Blank lines and `#`
/// comments are skipped, as are lines that are neither extents nor
/// `key=value` pairs. Unparseable numeric values fall back to zero.
///
/// # Errors
///
/// Returns an error only if reading from `reader` fails.
pub fn parse_descriptor<R: Read>(reader: R) -> Result<Descriptor> {
    let mut reader = BufReader::new(reader);
    let mut descriptor = Descriptor::default();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw).map_err(Error::io_simple)?;
        if n == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(extent) = parse_extent_line(line) {
            descriptor.extents.push(extent);
            continue;
        }

        let Some((key, value)) = parse_key_value(line) else {
            continue;
        };

        if let Some(ddb_key) = key.strip_prefix(DDB_PREFIX) {
            descriptor.ddb.insert(ddb_key.to_string(), value);
            continue;
        }

        match key.to_lowercase().as_str() {
            "encoding" => descriptor.encoding = value,
            "version" => descriptor.version = value.parse().unwrap_or(0),
            "cid" => {
                if let Ok(cid) = value.parse() {
                    descriptor.cid = cid;
                }
            }
            "parentcid" => {
                if let Ok(cid) = value.parse() {
                    descriptor.parent_cid = cid;
                }
            }
            "createtype" => descriptor.create_type = value,
            _ => {}
        }
    }

    Ok(descriptor)
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim().trim_matches('"');
    Some((key.trim().to_string(), value.to_string()))
}

/// Parse an extent line like: `RW 838860800 FLAT "TestVM-flat.vmdk" 0`.
///
/// Returns None when the line does not follow the extent grammar.
fn parse_extent_line(line: &str) -> Option<Extent> {
    let (permission, rest) = line.split_once(char::is_whitespace)?;
    let permission = permission.parse().ok()?;

    let (size, rest) = rest.trim_start().split_once(char::is_whitespace)?;
    let size = size.parse().ok()?;

    let rest = rest.trim_start();
    let (extent_type, rest) = match rest.split_once(char::is_whitespace) {
        Some((extent_type, rest)) => (extent_type, rest),
        None => (rest, ""),
    };
    if extent_type.is_empty() {
        return None;
    }

    let (info, offset) = parse_quoted_info_and_offset(rest);

    Some(Extent {
        permission,
        size,
        extent_type: extent_type.to_string(),
        info,
        offset,
    })
}

/// Parse a quoted info field followed by an optional offset: `"disk.vmdk" 0`.
fn parse_quoted_info_and_offset(s: &str) -> (String, Option<u64>) {
    let s = s.trim();

    if let Some(quoted) = s.strip_prefix('"') {
        if let Some(end_quote) = quoted.find('"') {
            let info = quoted[..end_quote].to_string();
            let offset = quoted[end_quote + 1..].trim().parse().ok();
            return (info, offset);
        }
    }

    (s.trim_matches('"').to_string(), None)
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_from_str() {
        assert_eq!("RW".parse::<Permission>().unwrap(), Permission::ReadWrite);
        assert_eq!("RDONLY".parse::<Permission>().unwrap(), Permission::ReadOnly);
        assert_eq!("NOACCESS".parse::<Permission>().unwrap(), Permission::NoAccess);
        assert!("rw".parse::<Permission>().is_err());
        assert!("WRITE".parse::<Permission>().is_err());
    }

    #[test]
    fn test_content_id_display() {
        assert_eq!(ContentId(0).to_string(), "00000000");
        assert_eq!(ContentId(0xfffffffe).to_string(), "fffffffe");
        assert_eq!(ContentId(0xAB).to_string(), "000000ab");
    }

    #[test]
    fn test_content_id_from_str() {
        assert_eq!("fffffffe".parse::<ContentId>().unwrap(), ContentId(0xfffffffe));
        assert_eq!("0x1f".parse::<ContentId>().unwrap(), ContentId(0x1f));
        assert!("zzz".parse::<ContentId>().is_err());
        assert!("".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_content_id_stops_at_first_non_hex() {
        assert_eq!("1a2bzz".parse::<ContentId>().unwrap(), ContentId(0x1a2b));
        assert_eq!("0xffg".parse::<ContentId>().unwrap(), ContentId(0xff));
        assert!("123456789".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_parse_key_value_no_spaces() {
        let (key, value) = parse_key_value("version=1").unwrap();
        assert_eq!(key, "version");
        assert_eq!(value, "1");
    }

    #[test]
    fn test_parse_key_value_with_spaces() {
        let (key, value) = parse_key_value("ddb.geometry.cylinders = \"52216\"").unwrap();
        assert_eq!(key, "ddb.geometry.cylinders");
        assert_eq!(value, "52216");
    }

    #[test]
    fn test_parse_key_value_splits_on_first_equals() {
        let (key, value) = parse_key_value("ddb.comment = \"a=b\"").unwrap();
        assert_eq!(key, "ddb.comment");
        assert_eq!(value, "a=b");
        assert!(parse_key_value("no equals here").is_none());
    }

    #[test]
    fn test_parse_extent_line() {
        let extent = parse_extent_line("RW 838860800 FLAT \"TestVM-flat.vmdk\" 0").unwrap();
        assert_eq!(extent.permission, Permission::ReadWrite);
        assert_eq!(extent.size, 838860800);
        assert_eq!(extent.extent_type, "FLAT");
        assert_eq!(extent.info, "TestVM-flat.vmdk");
        assert_eq!(extent.offset, Some(0));
    }

    #[test]
    fn test_parse_extent_line_without_info() {
        let extent = parse_extent_line("RDONLY 2048 ZERO").unwrap();
        assert_eq!(extent.permission, Permission::ReadOnly);
        assert_eq!(extent.extent_type, "ZERO");
        assert_eq!(extent.info, "");
        assert_eq!(extent.offset, None);
    }

    #[test]
    fn test_parse_extent_line_info_with_spaces() {
        let extent = parse_extent_line("RW 12345 SPARSE \"my disk file.vmdk\"").unwrap();
        assert_eq!(extent.info, "my disk file.vmdk");
        assert_eq!(extent.offset, None);
    }

    #[test]
    fn test_parse_extent_line_rejects_non_extents() {
        assert!(parse_extent_line("version=1").is_none());
        assert!(parse_extent_line("RW abc SPARSE \"x\"").is_none());
        assert!(parse_extent_line("RW 100").is_none());
        assert!(parse_extent_line("WRITE 100 SPARSE \"x\"").is_none());
    }

    #[test]
    fn test_extent_display() {
        let mut extent = Extent::new(2048, "SPARSE", "disk.vmdk");
        assert_eq!(extent.to_string(), "RW 2048 SPARSE \"disk.vmdk\"");
        extent.offset = Some(0);
        assert_eq!(extent.to_string(), "RW 2048 SPARSE \"disk.vmdk\" 0");
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = Descriptor::default();
        assert_eq!(descriptor.encoding, "UTF-8");
        assert_eq!(descriptor.version, 1);
        assert_eq!(descriptor.create_type, "vmfs");
        assert!(descriptor.extents.is_empty());
        assert!(descriptor.ddb.is_empty());
    }

    #[test]
    fn test_capacity() {
        let descriptor = Descriptor::new(vec![
            Extent::new(1000, "FLAT", "a.vmdk"),
            Extent::new(2000, "FLAT", "b.vmdk"),
        ]);
        assert_eq!(descriptor.capacity(), 3000 * 512);
    }

    #[test]
    fn test_render_template() {
        let mut descriptor = Descriptor::new(vec![Extent::new(2048, "SPARSE", "disk.vmdk")]);
        descriptor.cid = ContentId(0x1234abcd);
        descriptor.ddb.insert("adapterType".to_string(), "lsilogic".to_string());

        let text = descriptor.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# Disk DescriptorFile");
        assert_eq!(lines[1], "version=1");
        assert_eq!(lines[2], "encoding=\"UTF-8\"");
        assert_eq!(lines[3], "CID=1234abcd");
        assert_eq!(lines[4], "parentCID=00000000");
        assert_eq!(lines[5], "createType=\"vmfs\"");
        assert!(text.contains("# Capacity: 1.00 MB\n"));
        assert!(text.contains("\nRW 2048 SPARSE \"disk.vmdk\"\n"));
        assert!(text.ends_with("#DDB\nddb.adapterType = \"lsilogic\"\n"));
    }

    #[test]
    fn test_parse_trims_nul_padding() {
        let mut sector = b"version=2\ncreateType=\"streamOptimized\"\n".to_vec();
        sector.resize(512, 0);
        let descriptor = parse_descriptor(&sector[..]).unwrap();
        assert_eq!(descriptor.version, 2);
        assert_eq!(descriptor.create_type, "streamOptimized");
    }

    #[test]
    fn test_capacity_saturates() {
        let text = "RW 18446744073709551615 SPARSE \"x\"\n";
        let descriptor = parse_descriptor(text.as_bytes()).unwrap();
        assert_eq!(descriptor.extents[0].size, u64::MAX);
        assert_eq!(descriptor.extents[0].size_bytes(), u64::MAX);
        assert_eq!(descriptor.capacity(), u64::MAX);

        let descriptor = Descriptor::new(vec![
            Extent::new(u64::MAX / SECTOR_SIZE, "FLAT", "a.vmdk"),
            Extent::new(u64::MAX / SECTOR_SIZE, "FLAT", "b.vmdk"),
        ]);
        assert_eq!(descriptor.capacity(), u64::MAX);
    }

    #[test]
    fn test_parse_bad_numbers_fall_back() {
        let descriptor = parse_descriptor("version=abc\nCID=nothex\n".as_bytes()).unwrap();
        assert_eq!(descriptor.version, 0);
        assert_eq!(descriptor.cid, ContentId(0));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(1 << 30), "1.00 GB");
        assert_eq!(format_bytes(1 << 40), "1.00 TB");
    }
}
