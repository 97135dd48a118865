//! `gnt-node` storage commands.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::context::QaContext;
use crate::error::{QaError, QaResult};
use crate::types::Outcome;

/// Fields every storage type reports.
pub const VALID_STORAGE_FIELDS: &[&str] = &["name", "size", "used", "free", "allocatable"];

pub const SF_NODE: &str = "node";
pub const SF_TYPE: &str = "type";
pub const SF_ALLOCATABLE: &str = "allocatable";

/// Repair operation of `gnt-node repair-storage`.
pub const SO_FIX_CONSISTENCY: &str = "fix-consistency";

/// Separator used when listing storage units for parsing.
const LIST_SEPARATOR: char = '|';

/// Storage backend kinds a node can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    File,
    LvmPv,
    LvmVg,
}

impl StorageType {
    pub const ALL: [StorageType; 3] = [StorageType::File, StorageType::LvmPv, StorageType::LvmVg];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::LvmPv => "lvm-pv",
            StorageType::LvmVg => "lvm-vg",
        }
    }

    /// Fields `modify-storage` may change for this type.
    pub fn modifiable_fields(&self) -> &'static [&'static str] {
        match self {
            StorageType::LvmPv => &[SF_ALLOCATABLE],
            StorageType::File | StorageType::LvmVg => &[],
        }
    }

    /// Operations `repair-storage` supports for this type.
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            StorageType::LvmVg => &[SO_FIX_CONSISTENCY],
            StorageType::File | StorageType::LvmPv => &[],
        }
    }

    pub fn is_modifiable(&self, field: &str) -> bool {
        self.modifiable_fields().contains(&field)
    }

    pub fn supports(&self, operation: &str) -> bool {
        self.operations().contains(&operation)
    }

    /// Every field `list-storage --output` accepts.
    pub fn all_fields() -> Vec<&'static str> {
        VALID_STORAGE_FIELDS
            .iter()
            .copied()
            .chain([SF_NODE, SF_TYPE])
            .collect()
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown storage type: {s}"))
    }
}

/// One storage unit as listed by `node,name,allocatable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub node: String,
    pub name: String,
    pub allocatable: bool,
}

impl StorageUnit {
    pub fn parse_line(line: &str) -> QaResult<Self> {
        let fields: Vec<&str> = line.trim().split(LIST_SEPARATOR).collect();
        let [node, name, allocatable] = fields.as_slice() else {
            return Err(QaError::Node(format!("malformed storage line: {line:?}")));
        };
        Ok(Self {
            node: node.to_string(),
            name: name.to_string(),
            allocatable: allocatable.eq_ignore_ascii_case("y"),
        })
    }

    pub fn parse_listing(text: &str) -> QaResult<Vec<Self>> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }

    /// Allocatable values to set so the unit ends where it started.
    pub fn allocatable_toggle(&self) -> [&'static str; 2] {
        if self.allocatable {
            ["no", "yes"]
        } else {
            ["yes", "no"]
        }
    }
}

/// Storage units of one type across the cluster.
pub async fn list_units(ctx: &QaContext, storage_type: StorageType) -> QaResult<Vec<StorageUnit>> {
    let separator = format!("--separator={LIST_SEPARATOR}");
    let argv = ctx.node_cmd(&[
        "list-storage",
        "--storage-type",
        storage_type.as_str(),
        "--output=node,name,allocatable",
        &separator,
        "--no-headers",
    ]);
    let output = ctx.command_output(&argv).await?;
    StorageUnit::parse_listing(&output)
}

/// List, modify and repair storage for every storage type.
pub async fn test_storage(ctx: &QaContext) -> QaResult<()> {
    let all_fields = format!("--output={}", StorageType::all_fields().join(","));

    for storage_type in StorageType::ALL {
        let st = storage_type.as_str();
        info!(storage_type = st, "Testing gnt-node storage");

        ctx.assert_command(
            &ctx.node_cmd(&["list-storage", "--storage-type", st]),
            Outcome::Success,
        )
        .await?;
        ctx.assert_command(
            &ctx.node_cmd(&["list-storage", "--storage-type", st, &all_fields]),
            Outcome::Success,
        )
        .await?;

        let units = list_units(ctx, storage_type).await?;
        for unit in units.iter().take(ctx.settings().storage_test_units) {
            // No-op modification
            ctx.assert_command(
                &ctx.node_cmd(&["modify-storage", &unit.node, st, &unit.name]),
                Outcome::Success,
            )
            .await?;

            let expect = Outcome::expect_failure(!storage_type.is_modifiable(SF_ALLOCATABLE));
            for value in unit.allocatable_toggle() {
                ctx.assert_command(
                    &ctx.node_cmd(&[
                        "modify-storage",
                        "--allocatable",
                        value,
                        &unit.node,
                        st,
                        &unit.name,
                    ]),
                    expect,
                )
                .await?;
            }

            let expect = Outcome::expect_failure(!storage_type.supports(SO_FIX_CONSISTENCY));
            ctx.assert_command(
                &ctx.node_cmd(&["repair-storage", &unit.node, st, &unit.name]),
                expect,
            )
            .await?;
        }
    }
    Ok(())
}
