//! Minimal OVF envelope for importing a single stream-optimized disk.
//!
//! The envelope describes a bare virtual machine with one SCSI controller
//! and the disk from [`Info`]; importers create the VM and then detach the
//! uploaded disk.

use std::fmt::Write;

use quick_xml::escape::escape;

use crate::error::{Error, Result};
use crate::vmdk::Info;

/// Format URI identifying stream-optimized VMDK disks.
pub const STREAM_OPTIMIZED_FORMAT: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// Expands the OVF import envelope for `info`.
pub fn render_envelope(info: &Info) -> Result<String> {
    let name = escape(info.name.as_str());
    let import_name = escape(info.import_name.as_str());

    let mut out = String::with_capacity(4096);
    write_envelope(&mut out, &name, &import_name, info.size, info.capacity)
        .map_err(|e| Error::vmdk(format!("failed to render OVF envelope: {}", e)))?;
    Ok(out)
}

fn write_envelope(
    out: &mut String,
    name: &str,
    import_name: &str,
    size: u64,
    capacity: u64,
) -> std::fmt::Result {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(out, r#"<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1""#)?;
    writeln!(out, r#"          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1""#)?;
    writeln!(out, r#"          xmlns:cim="http://schemas.dmtf.org/wbem/wscim/1/common""#)?;
    writeln!(
        out,
        r#"          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData""#
    )?;
    writeln!(out, r#"          xmlns:vmw="http://www.vmware.com/schema/ovf""#)?;
    writeln!(
        out,
        r#"          xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData""#
    )?;
    writeln!(out, r#"          xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#)?;

    writeln!(out, "  <References>")?;
    writeln!(
        out,
        r#"    <File ovf:href="{}" ovf:id="file1" ovf:size="{}"/>"#,
        name, size
    )?;
    writeln!(out, "  </References>")?;

    writeln!(out, "  <DiskSection>")?;
    writeln!(out, "    <Info>Virtual disk information</Info>")?;
    writeln!(
        out,
        r#"    <Disk ovf:capacity="{}" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="{}" ovf:populatedSize="0"/>"#,
        capacity, STREAM_OPTIMIZED_FORMAT
    )?;
    writeln!(out, "  </DiskSection>")?;

    writeln!(out, r#"  <VirtualSystem ovf:id="{}">"#, import_name)?;
    writeln!(out, "    <Info>A virtual machine</Info>")?;
    writeln!(out, "    <Name>{}</Name>", import_name)?;
    writeln!(
        out,
        r#"    <OperatingSystemSection ovf:id="100" vmw:osType="other26xLinux64Guest">"#
    )?;
    writeln!(out, "      <Info>The kind of installed guest operating system</Info>")?;
    writeln!(out, "    </OperatingSystemSection>")?;

    writeln!(out, "    <VirtualHardwareSection>")?;
    writeln!(out, "      <Info>Virtual hardware requirements</Info>")?;
    writeln!(out, "      <System>")?;
    writeln!(out, "        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>")?;
    writeln!(out, "        <vssd:InstanceID>0</vssd:InstanceID>")?;
    writeln!(
        out,
        "        <vssd:VirtualSystemIdentifier>{}</vssd:VirtualSystemIdentifier>",
        import_name
    )?;
    writeln!(out, "        <vssd:VirtualSystemType>vmx-07</vssd:VirtualSystemType>")?;
    writeln!(out, "      </System>")?;

    write_item(
        out,
        &[
            ("AllocationUnits", "hertz * 10^6"),
            ("Description", "Number of Virtual CPUs"),
            ("ElementName", "1 virtual CPU(s)"),
            ("InstanceID", "1"),
            ("ResourceType", "3"),
            ("VirtualQuantity", "1"),
        ],
        None,
    )?;
    write_item(
        out,
        &[
            ("AllocationUnits", "byte * 2^20"),
            ("Description", "Memory Size"),
            ("ElementName", "1024MB of memory"),
            ("InstanceID", "2"),
            ("ResourceType", "4"),
            ("VirtualQuantity", "1024"),
        ],
        None,
    )?;
    write_item(
        out,
        &[
            ("Address", "0"),
            ("Description", "SCSI Controller"),
            ("ElementName", "SCSI Controller 0"),
            ("InstanceID", "3"),
            ("ResourceSubType", "VirtualSCSI"),
            ("ResourceType", "6"),
        ],
        None,
    )?;
    write_item(
        out,
        &[
            ("AddressOnParent", "0"),
            ("ElementName", "Hard Disk 1"),
            ("HostResource", "ovf:/disk/vmdisk1"),
            ("InstanceID", "9"),
            ("Parent", "3"),
            ("ResourceType", "17"),
        ],
        Some(r#"<vmw:Config ovf:required="false" vmw:key="backing.writeThrough" vmw:value="false"/>"#),
    )?;

    writeln!(out, "    </VirtualHardwareSection>")?;
    writeln!(out, "  </VirtualSystem>")?;
    write!(out, "</Envelope>")
}

/// Writes one `<Item>` of `rasd:` elements.
fn write_item(out: &mut String, fields: &[(&str, &str)], extra: Option<&str>) -> std::fmt::Result {
    writeln!(out, "      <Item>")?;
    for (tag, value) in fields {
        writeln!(out, "        <rasd:{tag}>{value}</rasd:{tag}>")?;
    }
    if let Some(extra) = extra {
        writeln!(out, "        {}", extra)?;
    }
    writeln!(out, "      </Item>")
}

impl Info {
    /// Returns the expanded OVF import envelope for this disk.
    pub fn ovf(&self) -> Result<String> {
        render_envelope(self)
    }
}
