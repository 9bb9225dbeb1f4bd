//! The manifest model (component B): pure data parsed out of a gadget
//! YAML document. This module owns no I/O; `serde` derives carry the
//! on-wire shape, but picking a concrete deserializer (YAML) is left to
//! the caller (§1 Non-goals — we describe only the semantic model).

use crate::error::{Error, Result};
use crate::quantity::{RelativeOffset, Size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A GPT or MBR partitioning scheme.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Schema {
    #[default]
    Gpt,
    Mbr,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    Grub,
    UBoot,
    AndroidBoot,
    Lk,
    Piboot,
}

/// Semantic label on a structure; drives default labels and validation
/// (invariants 4 and 5, §3.5).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    #[serde(rename = "")]
    None,
    Mbr,
    SystemBoot,
    SystemSeed,
    SystemData,
    SystemSave,
    Bootimg,
    Bootselect,
}

impl Role {
    /// The implicit filesystem label a structure of this role takes when
    /// none is given explicitly (invariant 5). `seeded` is true when the
    /// gadget declares a `system-seed` structure (affects `system-data`'s
    /// implicit label).
    pub fn implicit_label(self, seeded: bool) -> Option<&'static str> {
        match self {
            Role::SystemBoot => Some("ubuntu-boot"),
            Role::SystemSeed => Some("ubuntu-seed"),
            Role::SystemSave => Some("ubuntu-save"),
            Role::SystemData => Some(if seeded { "ubuntu-data" } else { "writable" }),
            _ => None,
        }
    }
}

/// `"bare"`, a 2-hex MBR id, a 36-char GUID, or `"<mbr>,<guid>"` (hybrid).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureType {
    Bare,
    Mbr(u8),
    Guid(Uuid),
    Hybrid { mbr: u8, guid: Uuid },
}

impl StructureType {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "bare" {
            return Ok(StructureType::Bare);
        }
        if let Some((mbr_part, guid_part)) = s.split_once(',') {
            let mbr = parse_mbr_id(mbr_part)?;
            let guid = Uuid::parse_str(guid_part)
                .map_err(|e| Error::Parse(format!("invalid GUID in type {s:?}: {e}")))?;
            return Ok(StructureType::Hybrid { mbr, guid });
        }
        if s.len() == 2 {
            return Ok(StructureType::Mbr(parse_mbr_id(s)?));
        }
        let guid = Uuid::parse_str(s)
            .map_err(|e| Error::Parse(format!("invalid structure type {s:?}: {e}")))?;
        Ok(StructureType::Guid(guid))
    }

    pub fn is_bare(&self) -> bool {
        matches!(self, StructureType::Bare)
    }
}

fn parse_mbr_id(s: &str) -> Result<u8> {
    u8::from_str_radix(s, 16).map_err(|_| Error::Parse(format!("invalid MBR type id {s:?}")))
}

impl Serialize for StructureType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let out = match self {
            StructureType::Bare => "bare".to_string(),
            StructureType::Mbr(id) => format!("{id:02X}"),
            StructureType::Guid(u) => u.to_string().to_uppercase(),
            StructureType::Hybrid { mbr, guid } => {
                format!("{mbr:02X},{}", guid.to_string().to_uppercase())
            }
        };
        s.serialize_str(&out)
    }
}

impl<'de> Deserialize<'de> for StructureType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        StructureType::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Permitted filesystem kinds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Filesystem {
    #[default]
    #[serde(rename = "")]
    None,
    Ext4,
    Vfat,
    #[serde(rename = "vfat-16")]
    Vfat16,
}

impl Filesystem {
    pub fn is_filesystem(self) -> bool {
        !matches!(self, Filesystem::None)
    }

    /// Filesystem types permitted for a given partitioning scheme (invariant 7).
    /// Both schemas currently permit the same whitelist; this stays a
    /// method (rather than a constant) because schema-specific
    /// restrictions are the kind of thing gadget manifests grow over time.
    pub fn allowed_for(self, _schema: Schema) -> bool {
        true
    }
}

/// The subset of `{schema, filesystem, size, structure}` a volume defers
/// to the installer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PartialFields {
    #[serde(default)]
    pub schema: bool,
    #[serde(default)]
    pub filesystem: bool,
    #[serde(default)]
    pub size: bool,
    #[serde(default)]
    pub structure: bool,
}

impl PartialFields {
    pub fn any(self) -> bool {
        self.schema || self.filesystem || self.size || self.structure
    }
}

/// Image content inside a `bare` structure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ImageContent {
    pub image: String,
    pub offset: Option<Size>,
    #[serde(default)]
    pub offset_write: Option<RelativeOffset>,
    pub size: Option<Size>,
    #[serde(default)]
    pub unpack: bool,
}

/// Content copied into a mounted filesystem.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FilesystemContent {
    pub source: String,
    pub target: String,
}

/// Tagged union per design note in §9: a sum type rather than the
/// optional-fields encoding the original uses. Untagged so the wire shape
/// stays a plain `{image: ...}` or `{source, target}` mapping.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum VolumeContent {
    Image(ImageContent),
    Filesystem(FilesystemContent),
}

/// `update: { edition, preserve }` on a structure.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct UpdateInfo {
    #[serde(default)]
    pub edition: u32,
    #[serde(default)]
    pub preserve: Vec<String>,
}

/// One partition (or bare region) inside a [`Volume`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct VolumeStructure {
    pub name: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "type")]
    pub structure_type: StructureType,
    pub id: Option<Uuid>,
    #[serde(default)]
    pub filesystem: Filesystem,
    pub offset: Option<crate::quantity::Offset>,
    #[serde(default)]
    pub offset_write: Option<RelativeOffset>,
    #[serde(default)]
    pub min_size: Size,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub content: Vec<VolumeContent>,
    #[serde(default)]
    pub update: UpdateInfo,
    /// Stable position in the manifest; never reordered by the engine.
    /// Filled in by the parser, not read from the wire.
    #[serde(skip)]
    pub yaml_index: usize,
}

impl VolumeStructure {
    /// The effective filesystem label: explicit `label`, else the role's
    /// implicit label (invariant 5).
    pub fn effective_label(&self, seeded: bool) -> Option<String> {
        self.label
            .clone()
            .or_else(|| self.role.implicit_label(seeded).map(str::to_string))
    }

    pub fn is_bare(&self) -> bool {
        self.structure_type.is_bare()
    }
}

/// One block device's worth of partition layout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Volume {
    /// Filled in from the `volumes` mapping key, not read from the wire.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub schema: Schema,
    pub bootloader: Option<Bootloader>,
    pub id: Option<String>,
    #[serde(default)]
    pub partial: PartialFields,
    #[serde(default)]
    pub structure: Vec<VolumeStructure>,
}

impl Volume {
    pub fn structure_by_name(&self, name: &str) -> Option<&VolumeStructure> {
        self.structure
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// `true` if any structure in this volume declares `role: system-seed`.
    pub fn is_seeded(&self) -> bool {
        self.structure.iter().any(|s| s.role == Role::SystemSeed)
    }
}

/// `{plug: "snap:name", slot: "snap:name"}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub plug: String,
    pub slot: Option<String>,
}

impl Connection {
    /// Resolves the default `slot` (`"system:<plug-name>"`) per §6.1.
    pub fn effective_slot(&self) -> String {
        if let Some(slot) = &self.slot {
            return slot.clone();
        }
        let plug_name = self.plug.rsplit_once(':').map(|(_, n)| n).unwrap_or(&self.plug);
        format!("system:{plug_name}")
    }
}

/// `kernel-cmdline: {allow, append}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct KernelCmdline {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub append: Vec<String>,
}

/// Root of the parsed, normalized manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Info {
    pub volumes: BTreeMap<String, Volume>,
    pub defaults: BTreeMap<String, serde_json::Value>,
    pub connections: Vec<Connection>,
    #[serde(rename = "kernel-cmdline")]
    pub kernel_cmdline: KernelCmdline,
}

impl Info {
    /// The single volume declaring a bootloader, if validation already
    /// confirmed there is exactly one (invariant 2).
    pub fn bootloader_volume(&self) -> Option<&Volume> {
        self.volumes.values().find(|v| v.bootloader.is_some())
    }
}

/// Wire shape of [`Info`]; deserialized first, then normalized (structure
/// `name`/`yaml_index` filled in) into the public type.
#[derive(Deserialize)]
struct WireInfo {
    #[serde(default)]
    volumes: BTreeMap<String, Volume>,
    #[serde(default)]
    defaults: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    connections: Vec<Connection>,
    #[serde(default, rename = "kernel-cmdline")]
    kernel_cmdline: KernelCmdline,
}

impl<'de> Deserialize<'de> for Info {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let wire = WireInfo::deserialize(d)?;
        let mut volumes = wire.volumes;
        for (name, volume) in volumes.iter_mut() {
            volume.name = name.clone();
            for (idx, structure) in volume.structure.iter_mut().enumerate() {
                structure.yaml_index = idx;
            }
        }
        Ok(Info {
            volumes,
            defaults: wire.defaults,
            connections: wire.connections,
            kernel_cmdline: wire.kernel_cmdline,
        })
    }
}
