//! Testbed device registry
//!
//! Device names follow fixed patterns (`wfa_control_agent_*`,
//! `wfa_console_ctrl`, `wfa_sniffer*`, ...). The class decides how
//! responses are judged; the registry maps a name to its `host:port`.

use std::sync::OnceLock;

use regex::Regex;

use crate::command_list::{CommandList, Tag};
use crate::ordered::OrderedMap;

/// Role of a testbed device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Station or DUT control agent
    Agent,
    /// Console, also fronts the AP-configuration server
    Console,
    Sniffer,
    Radius,
    AccessPoint,
}

fn patterns() -> &'static [(Regex, DeviceClass)] {
    static PATTERNS: OnceLock<Vec<(Regex, DeviceClass)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"^wfa_control_agent(_[A-Za-z0-9_]+)?$", DeviceClass::Agent),
            (r"^wfa_console_(ctrl|tg)$", DeviceClass::Console),
            (r"^wfa_sniffer(_[A-Za-z0-9_]+)?$", DeviceClass::Sniffer),
            (r"^wfa_radius(_[A-Za-z0-9_]+)?$", DeviceClass::Radius),
            (r"^wfa_ap(_[A-Za-z0-9_]+)?$", DeviceClass::AccessPoint),
        ]
        .into_iter()
        .map(|(p, c)| (Regex::new(p).expect("static pattern"), c))
        .collect()
    })
}

/// Class of a device name, or `None` if it matches no device pattern.
pub fn classify_name(name: &str) -> Option<DeviceClass> {
    patterns()
        .iter()
        .find(|(re, _)| re.is_match(name))
        .map(|(_, class)| *class)
}

/// Lookup contract the scheduler compiles against
pub trait DeviceRegistry: Send + Sync {
    /// `host:port` for a device name
    fn resolve(&self, name: &str) -> Option<String>;

    /// Access points active in the current test case
    fn active_aps(&self) -> Vec<String>;

    fn is_active_ap(&self, name: &str) -> bool {
        self.active_aps().iter().any(|ap| ap.eq_ignore_ascii_case(name))
    }

    fn class_of(&self, name: &str) -> Option<DeviceClass> {
        classify_name(name)
    }
}

/// Default registry, filled from device definitions in the script
#[derive(Debug, Clone, Default)]
pub struct Testbed {
    devices: OrderedMap<String>,
    active_aps: Vec<String>,
}

impl Testbed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or re-point a device.
    pub fn insert(&mut self, name: impl Into<String>, host: &str, port: &str) {
        self.devices.insert(name, format!("{}:{}", host.trim(), port.trim()));
    }

    pub fn set_active_aps<I, S>(&mut self, aps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_aps = aps
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
    }

    /// Register every TESTBED-DEVICE node of a compiled script.
    pub fn load_definitions(&mut self, list: &CommandList) {
        for node in list.iter().filter(|n| n.tag == Tag::TestbedDevice) {
            if let (Some(name), Some(host), Some(port)) = (node.get("name"), node.get("host"), node.get("port")) {
                tracing::debug!(device = name, host, port, "testbed device");
                self.insert(name, host, port);
            }
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = (&str, &String)> {
        self.devices.iter()
    }
}

impl DeviceRegistry for Testbed {
    fn resolve(&self, name: &str) -> Option<String> {
        self.devices.get(name).cloned()
    }

    fn active_aps(&self) -> Vec<String> {
        self.active_aps.clone()
    }
}

/// Parse a device definition body such as `ipaddr=10.0.0.2,port=9000`.
pub fn parse_definition(body: &str) -> Option<(String, String)> {
    let mut host = None;
    let mut port = None;
    for field in body.split(',') {
        let (key, value) = match field.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "ipaddr" => host = Some(value.trim().to_string()),
            "port" => port = Some(value.trim().to_string()),
            _ => {}
        }
    }
    Some((host?, port?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_names() {
        assert_eq!(classify_name("wfa_control_agent_dut"), Some(DeviceClass::Agent));
        assert_eq!(classify_name("wfa_control_agent"), Some(DeviceClass::Agent));
        assert_eq!(classify_name("wfa_console_ctrl"), Some(DeviceClass::Console));
        assert_eq!(classify_name("wfa_sniffer"), Some(DeviceClass::Sniffer));
        assert_eq!(classify_name("wfa_radius_1"), Some(DeviceClass::Radius));
        assert_eq!(classify_name("STA"), None);
    }

    #[test]
    fn test_testbed_resolve() {
        let mut tb = Testbed::new();
        tb.insert("wfa_control_agent_dut", "10.0.0.2 ", "9000");
        tb.set_active_aps(["AP1", "", "AP2"]);
        assert_eq!(tb.resolve("wfa_control_agent_dut").as_deref(), Some("10.0.0.2:9000"));
        assert_eq!(tb.active_aps(), vec!["AP1", "AP2"]);
        assert!(tb.is_active_ap("ap2"));
    }

    #[test]
    fn test_load_definitions() {
        let mut list = CommandList::new();
        list.push(
            Tag::TestbedDevice,
            [("name", "wfa_sniffer"), ("host", "10.0.0.9"), ("port", "9999")],
            "init.txt",
            3,
        );
        let mut tb = Testbed::new();
        tb.load_definitions(&list);
        assert_eq!(tb.resolve("wfa_sniffer").as_deref(), Some("10.0.0.9:9999"));
        assert_eq!(tb.class_of("wfa_sniffer"), Some(DeviceClass::Sniffer));
    }

    #[test]
    fn test_parse_definition() {
        assert_eq!(
            parse_definition("ipaddr=192.168.250.10, port=9000"),
            Some(("192.168.250.10".into(), "9000".into()))
        );
        assert_eq!(parse_definition("ipaddr=1.2.3.4"), None);
    }
}
