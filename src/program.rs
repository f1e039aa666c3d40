//! Program-specific configuration strategies
//!
//! Each certification program decorates a handful of variables (band,
//! channel width, security names) before they are substituted into task
//! parameters. Strategies are looked up by program name; concrete ones
//! delegate to [`BaseProgram`] for everything they do not override.

use std::collections::HashMap;
use std::sync::Arc;

/// Variable decorations for one certification program
pub trait ProgramConfig: Send + Sync {
    /// Program name as used on the command line and in `$Program`
    fn name(&self) -> &str;

    /// Script variables seeded into every run of this program
    fn defaults(&self) -> Vec<(String, String)> {
        BaseProgram.defaults_for(self.name())
    }

    /// Rewrite `value` of variable `key` for the wire, or `None` to keep it
    fn decorate(&self, key: &str, value: &str) -> Option<String> {
        BaseProgram.decorate(key, value)
    }
}

/// Default behavior shared by every program
pub struct BaseProgram;

impl BaseProgram {
    fn defaults_for(&self, program: &str) -> Vec<(String, String)> {
        vec![("Program".to_string(), program.to_string())]
    }
}

impl ProgramConfig for BaseProgram {
    fn name(&self) -> &str {
        "base"
    }

    fn defaults(&self) -> Vec<(String, String)> {
        self.defaults_for("base")
    }

    fn decorate(&self, key: &str, value: &str) -> Option<String> {
        if !key.to_ascii_lowercase().contains("security") && !key.eq_ignore_ascii_case("keymgmt") {
            return None;
        }
        let mapped = match value.to_ascii_uppercase().as_str() {
            "WPA2-PSK" | "WPA2PSK" => "wpa2-psk",
            "WPA2-ENT" | "WPA2-ENTERPRISE" => "wpa2-ent",
            "OPEN" | "NONE" => "none",
            _ => return None,
        };
        Some(mapped.to_string())
    }
}

/// Protected Management Frames
pub struct PmfProgram;

impl ProgramConfig for PmfProgram {
    fn name(&self) -> &str {
        "PMF"
    }

    fn defaults(&self) -> Vec<(String, String)> {
        let mut vars = BaseProgram.defaults_for(self.name());
        vars.push(("PMF".to_string(), "Required".to_string()));
        vars
    }
}

/// WPA3 personal/enterprise
pub struct Wpa3Program;

impl ProgramConfig for Wpa3Program {
    fn name(&self) -> &str {
        "WPA3"
    }

    fn decorate(&self, key: &str, value: &str) -> Option<String> {
        if key.eq_ignore_ascii_case("keymgmt") && value.eq_ignore_ascii_case("SAE") {
            return Some("wpa2-sae".to_string());
        }
        BaseProgram.decorate(key, value)
    }
}

/// Very High Throughput (11ac)
pub struct VhtProgram;

impl ProgramConfig for VhtProgram {
    fn name(&self) -> &str {
        "VHT"
    }

    fn decorate(&self, key: &str, value: &str) -> Option<String> {
        if key.eq_ignore_ascii_case("band") && value.eq_ignore_ascii_case("5G") {
            return Some("11ac".to_string());
        }
        BaseProgram.decorate(key, value)
    }
}

/// High Efficiency (11ax)
pub struct HeProgram;

impl ProgramConfig for HeProgram {
    fn name(&self) -> &str {
        "HE"
    }

    fn decorate(&self, key: &str, value: &str) -> Option<String> {
        if key.eq_ignore_ascii_case("band") {
            let mode = match value.to_ascii_uppercase().as_str() {
                "2.4G" | "24G" => "11ax-2g",
                "5G" => "11ax-5g",
                "6G" => "11ax-6g",
                _ => return BaseProgram.decorate(key, value),
            };
            return Some(mode.to_string());
        }
        BaseProgram.decorate(key, value)
    }
}

/// Registry of program strategies keyed by upper-case name
pub struct ProgramRegistry {
    programs: HashMap<String, Arc<dyn ProgramConfig>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        let mut programs: HashMap<String, Arc<dyn ProgramConfig>> = HashMap::new();
        programs.insert("PMF".into(), Arc::new(PmfProgram));
        programs.insert("WPA3".into(), Arc::new(Wpa3Program));
        programs.insert("VHT".into(), Arc::new(VhtProgram));
        programs.insert("HE".into(), Arc::new(HeProgram));
        Self { programs }
    }

    pub fn register(&mut self, program: Arc<dyn ProgramConfig>) {
        self.programs.insert(program.name().to_ascii_uppercase(), program);
    }

    /// Strategy for `name`; unknown programs fall back to the base behavior.
    pub fn get(&self, name: &str) -> Arc<dyn ProgramConfig> {
        match self.programs.get(&name.to_ascii_uppercase()) {
            Some(p) => Arc::clone(p),
            None => Arc::new(BaseProgram),
        }
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}
