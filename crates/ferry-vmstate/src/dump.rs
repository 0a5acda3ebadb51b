//! Machine-readable description of schemas, used to compare what two builds put on the wire.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmStateDump {
    pub name: &'static str,
    pub version_id: u32,
    pub minimum_version_id: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unmigratable: bool,
    pub fields: Vec<FieldDump>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subsections: Vec<VmStateDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDump {
    pub field: &'static str,
    pub kind: &'static str,
    pub version_id: u32,
    pub field_exists: bool,
    /// Element count when it is fixed by the schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub element: ElementDump,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementDump {
    Info { name: &'static str, size: usize },
    Struct(Box<VmStateDump>),
    Bytes,
    Bitmap,
    Unused,
}

impl VmStateDump {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
