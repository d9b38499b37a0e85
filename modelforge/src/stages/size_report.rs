//! ROM/RAM footprint estimate for the deployment binary.

use crate::errors::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// `<name>  <size>  <addr>` rows of `size -A`.
const SECTION_LINE: &str = r"(?m)^\s*(\.\S+)\s+(\d+)\s+(\d+)\s*$";

/// Section sizes plus derived footprint, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    /// Every section reported, by name.
    pub sections: BTreeMap<String, u64>,
    /// `.text`.
    pub text: u64,
    /// `.rodata`.
    pub rodata: u64,
    /// `.data`.
    pub data: u64,
    /// `.bss`.
    pub bss: u64,
    /// File size before stripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unstripped_bytes: Option<u64>,
    /// File size after stripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripped_bytes: Option<u64>,
}

impl SizeReport {
    /// Parses `size -A` output. Sections that do not appear count as zero.
    ///
    /// # Errors
    ///
    /// Returns `Internal` only if the section pattern fails to compile.
    pub fn parse(size_output: &str) -> Result<Self, PipelineError> {
        let pattern = Regex::new(SECTION_LINE).map_err(|e| PipelineError::Internal(e.to_string()))?;
        let mut report = Self::default();
        for caps in pattern.captures_iter(size_output) {
            let Ok(bytes) = caps[2].parse::<u64>() else {
                continue;
            };
            let name = &caps[1];
            match name {
                ".text" => report.text = bytes,
                ".rodata" => report.rodata = bytes,
                ".data" => report.data = bytes,
                ".bss" => report.bss = bytes,
                _ => {}
            }
            report.sections.insert(name.to_string(), bytes);
        }
        Ok(report)
    }

    /// Attaches the on-disk sizes of both binaries.
    #[must_use]
    pub fn with_file_sizes(mut self, unstripped: Option<u64>, stripped: Option<u64>) -> Self {
        self.unstripped_bytes = unstripped;
        self.stripped_bytes = stripped;
        self
    }

    /// Flash estimate: code, constants and initialised data.
    #[must_use]
    pub fn rom_bytes(&self) -> u64 {
        self.text + self.rodata + self.data
    }

    /// RAM estimate: initialised and zeroed data.
    #[must_use]
    pub fn ram_bytes(&self) -> u64 {
        self.data + self.bss
    }

    /// JSON rendering including the derived estimates.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert("rom_bytes".to_string(), self.rom_bytes().into());
            map.insert("ram_bytes".to_string(), self.ram_bytes().into());
        }
        value
    }

    /// Markdown table used in the deployment README.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("| Section | Bytes |\n|---|---|\n");
        for (name, value) in [
            (".text", self.text),
            (".rodata", self.rodata),
            (".data", self.data),
            (".bss", self.bss),
        ] {
            let _ = writeln!(out, "| `{name}` | {value} |");
        }
        let _ = writeln!(out, "\nEstimated ROM: {} bytes (text + rodata + data)", self.rom_bytes());
        let _ = writeln!(out, "Estimated RAM: {} bytes (data + bss)", self.ram_bytes());
        if let (Some(before), Some(after)) = (self.unstripped_bytes, self.stripped_bytes) {
            let _ = writeln!(out, "Binary size: {before} bytes unstripped, {after} bytes stripped");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "minimal_nn_stripped  :
section              size    addr
.interp                28     792
.text                1811    4160
.fini                  13    5972
.rodata               220    8192
.eh_frame             300    8416
.data                  16   16384
.bss                    8   16400
.comment               43       0
Total                2439
";

    #[test]
    fn test_parse_size_output() {
        let report = SizeReport::parse(SAMPLE).unwrap();
        assert_eq!(report.text, 1811);
        assert_eq!(report.rodata, 220);
        assert_eq!(report.data, 16);
        assert_eq!(report.bss, 8);
        assert_eq!(report.rom_bytes(), 1811 + 220 + 16);
        assert_eq!(report.ram_bytes(), 24);
        assert_eq!(report.sections.len(), 8);
        assert!(!report.sections.contains_key("Total"));
    }

    #[test]
    fn test_missing_sections_count_as_zero() {
        let report = SizeReport::parse(".text 100 0\n").unwrap();
        assert_eq!(report.rom_bytes(), 100);
        assert_eq!(report.ram_bytes(), 0);

        let empty = SizeReport::parse("size: 'minimal_nn_stripped': No such file").unwrap();
        assert_eq!(empty, SizeReport::default());
    }

    #[test]
    fn test_dict_and_markdown() {
        let report = SizeReport::parse(SAMPLE).unwrap().with_file_sizes(Some(16000), Some(14000));
        let dict = report.to_dict();
        assert_eq!(dict["rom_bytes"], 2047);
        assert_eq!(dict["stripped_bytes"], 14000);

        let md = report.to_markdown();
        assert!(md.contains("| `.text` | 1811 |"));
        assert!(md.contains("16000 bytes unstripped, 14000 bytes stripped"));
    }
}
