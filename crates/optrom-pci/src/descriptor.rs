use serde::de::IgnoredAny;
use serde::Deserialize;

use crate::config::{PciClassCode, PCI_BAR_COUNT};

/// One descriptor value as it appeared in the source document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(u64),
    /// Anything else (booleans, negative or fractional numbers, objects). Resolves to zero.
    Other(IgnoredAny),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Device description, still in its textual form.
///
/// Every field is optional; [`DeviceDescriptor::resolve`] turns missing or malformed values into
/// zero instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(default)]
    pub rom: Option<FieldValue>,
    #[serde(default)]
    pub vendor_id: Option<FieldValue>,
    #[serde(default)]
    pub device_id: Option<FieldValue>,
    #[serde(default)]
    pub class: Option<FieldValue>,
    #[serde(default)]
    pub subclass: Option<FieldValue>,
    #[serde(default)]
    pub prog_if: Option<FieldValue>,
    #[serde(default)]
    pub revision_id: Option<FieldValue>,
    #[serde(default, rename = "bar0size")]
    pub bar0_size: Option<FieldValue>,
    #[serde(default, rename = "bar1size")]
    pub bar1_size: Option<FieldValue>,
    #[serde(default, rename = "bar2size")]
    pub bar2_size: Option<FieldValue>,
    #[serde(default, rename = "bar3size")]
    pub bar3_size: Option<FieldValue>,
    #[serde(default, rename = "bar4size")]
    pub bar4_size: Option<FieldValue>,
    #[serde(default, rename = "bar5size")]
    pub bar5_size: Option<FieldValue>,
}

/// A descriptor with every field reduced to its numeric value.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ResolvedDescriptor {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: PciClassCode,
    pub bar_sizes: [u32; PCI_BAR_COUNT],
}

impl DeviceDescriptor {
    /// The `rom` path, if present as a string.
    pub fn rom_path(&self) -> Option<&str> {
        self.rom.as_ref().and_then(FieldValue::as_text)
    }

    pub fn bar_size_field(&self, index: usize) -> Option<&FieldValue> {
        match index {
            0 => self.bar0_size.as_ref(),
            1 => self.bar1_size.as_ref(),
            2 => self.bar2_size.as_ref(),
            3 => self.bar3_size.as_ref(),
            4 => self.bar4_size.as_ref(),
            5 => self.bar5_size.as_ref(),
            _ => None,
        }
    }

    pub fn set_bar_size(&mut self, index: usize, value: impl Into<FieldValue>) {
        let slot = match index {
            0 => &mut self.bar0_size,
            1 => &mut self.bar1_size,
            2 => &mut self.bar2_size,
            3 => &mut self.bar3_size,
            4 => &mut self.bar4_size,
            5 => &mut self.bar5_size,
            _ => panic!("BAR index {index} out of range"),
        };
        *slot = Some(value.into());
    }

    pub fn resolve(&self) -> ResolvedDescriptor {
        ResolvedDescriptor {
            vendor_id: hex_field("vendor_id", self.vendor_id.as_ref()),
            device_id: hex_field("device_id", self.device_id.as_ref()),
            class_code: PciClassCode {
                class: hex_field("class", self.class.as_ref()),
                subclass: hex_field("subclass", self.subclass.as_ref()),
                prog_if: hex_field("prog_if", self.prog_if.as_ref()),
                revision_id: hex_field("revision_id", self.revision_id.as_ref()),
            },
            bar_sizes: core::array::from_fn(|index| {
                size_field(BAR_SIZE_KEYS[index], self.bar_size_field(index))
            }),
        }
    }
}

const BAR_SIZE_KEYS: [&str; PCI_BAR_COUNT] = [
    "bar0size", "bar1size", "bar2size", "bar3size", "bar4size", "bar5size",
];

/// Identity fields are always hexadecimal; the `0x` prefix is optional.
fn hex_field<T: TryFrom<u64> + Default>(key: &str, field: Option<&FieldValue>) -> T {
    resolve_field(key, field, |text| {
        let digits = strip_hex_prefix(text).unwrap_or(text);
        u64::from_str_radix(digits, 16).ok()
    })
}

/// Sizes are hexadecimal with a `0x` prefix and decimal otherwise.
fn size_field(key: &str, field: Option<&FieldValue>) -> u32 {
    resolve_field(key, field, |text| match strip_hex_prefix(text) {
        Some(digits) => u64::from_str_radix(digits, 16).ok(),
        None => text.parse::<u64>().ok(),
    })
}

fn strip_hex_prefix(text: &str) -> Option<&str> {
    text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
}

fn resolve_field<T: TryFrom<u64> + Default>(
    key: &str,
    field: Option<&FieldValue>,
    parse_text: impl Fn(&str) -> Option<u64>,
) -> T {
    let Some(field) = field else {
        tracing::debug!(key, "descriptor field absent, using 0");
        return T::default();
    };

    let parsed = match field {
        FieldValue::Text(text) => parse_text(text.trim()),
        FieldValue::Number(n) => Some(*n),
        FieldValue::Other(_) => None,
    };

    match parsed.map(T::try_from) {
        Some(Ok(value)) => value,
        _ => {
            tracing::warn!(key, value = ?field, "descriptor field is not a valid number, using 0");
            T::default()
        }
    }
}
