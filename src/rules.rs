//! Rule Catalogue: CRUD over declarative security rules, vendor
//! filtering, and seeding of the built-in rule list.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;

use crate::error::{Error, Result};
use crate::store::{SecurityRule, Severity, Store};

pub struct RuleCatalogue {
    store: Arc<Store>,
}

impl RuleCatalogue {
    pub fn new(store: Arc<Store>) -> Self {
        RuleCatalogue { store }
    }

    pub fn create(&self, mut rule: SecurityRule) -> Result<SecurityRule> {
        validate(&rule)?;
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        rule.created_at = Utc::now();
        if self.store.rule_exists(&rule.name, &rule.vendor)? {
            return Err(Error::duplicate("name"));
        }
        self.store.insert_rule(&rule)?;
        Ok(rule)
    }

    pub fn update(&self, rule: SecurityRule) -> Result<SecurityRule> {
        validate(&rule)?;
        if !self.store.update_rule(&rule)? {
            return Err(Error::NotFound(format!("rule {}", rule.id)));
        }
        Ok(rule)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if !self.store.delete_rule(id)? {
            return Err(Error::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        if !self.store.set_rule_enabled(id, enabled)? {
            return Err(Error::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub fn get_all(&self) -> Result<Vec<SecurityRule>> {
        self.store.get_all_rules()
    }

    /// Every rule whose vendor equals `vendor` or `"generic"`, ordered
    /// by name.
    pub fn get_by_vendor(&self, vendor: &str) -> Result<Vec<SecurityRule>> {
        self.store.get_rules_by_vendor(vendor)
    }

    /// Seeds the catalogue from the built-in list, skipping any rule
    /// whose `(name, vendor)` pair already exists. Idempotent.
    pub fn load_predefined(&self) -> Result<usize> {
        let mut inserted = 0;
        for rule in predefined_rules() {
            if self.store.rule_exists(&rule.name, &rule.vendor)? {
                continue;
            }
            self.store.insert_rule(&rule)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

fn validate(rule: &SecurityRule) -> Result<()> {
    if rule.name.trim().is_empty() {
        return Err(Error::validation("name", "rule name must not be empty"));
    }
    if rule.command.trim().is_empty() {
        return Err(Error::validation("command", "rule command must not be empty"));
    }
    if !rule.expected_pattern.is_empty() {
        if let Err(e) = Regex::new(&rule.expected_pattern) {
            return Err(Error::validation(
                "expectedPattern",
                format!("pattern does not compile: {e}"),
            ));
        }
    }
    Ok(())
}

fn built_in(
    name: &str,
    description: &str,
    vendor: &str,
    command: &str,
    pattern: &str,
    severity: Severity,
) -> SecurityRule {
    SecurityRule {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: description.to_string(),
        vendor: vendor.to_string(),
        command: command.to_string(),
        expected_pattern: pattern.to_string(),
        severity,
        enabled: true,
        created_at: Utc::now(),
    }
}

/// The built-in rule list: one rule per spec-named category —
/// password hygiene (`enable-secret-configured`), remote-access
/// hardening (`ssh-enabled`, `telnet-disabled`, `vty-transport-ssh-only`),
/// unused-interface detection, console protection, SNMP community
/// strength, service password encryption, banners, HTTP-vs-HTTPS
/// management, and CDP exposure — across Cisco, Juniper, HP, Aruba and
/// a generic fallback. `wpa2-enterprise-enforced` is additional Aruba
/// vendor coverage, not a tenth category.
fn predefined_rules() -> Vec<SecurityRule> {
    vec![
        built_in(
            "enable-secret-configured",
            "Privileged EXEC access requires a hashed enable secret rather than a plaintext enable password",
            "cisco",
            "show running-config | include ^enable",
            r"enable secret",
            Severity::Critical,
        ),
        built_in(
            "ssh-enabled",
            "SSH transport is enabled for remote management",
            "cisco",
            "show ip ssh",
            r"SSH Enabled - version [12]\..*",
            Severity::High,
        ),
        built_in(
            "telnet-disabled",
            "Telnet is disabled on VTY lines",
            "cisco",
            "show running-config | include transport input",
            r"transport input ssh",
            Severity::High,
        ),
        built_in(
            "vty-transport-ssh-only",
            "VTY lines only accept SSH transport",
            "juniper",
            "show configuration system services",
            r"ssh",
            Severity::High,
        ),
        built_in(
            "no-unused-interfaces-enabled",
            "Unused interfaces are administratively shut down",
            "generic",
            "show interfaces description",
            r"admin down|shutdown",
            Severity::Medium,
        ),
        built_in(
            "console-password-set",
            "Console line requires a password",
            "cisco",
            "show running-config | section line con",
            r"password \S+",
            Severity::Medium,
        ),
        built_in(
            "snmp-community-not-default",
            "SNMP community string is not a well-known default",
            "generic",
            "show running-config | include snmp-server community",
            r"^(?!.*\b(public|private)\b).*snmp-server community",
            Severity::Critical,
        ),
        built_in(
            "service-password-encryption",
            "Locally stored passwords are encrypted",
            "cisco",
            "show running-config | include service password-encryption",
            r"service password-encryption",
            Severity::Medium,
        ),
        built_in(
            "login-banner-present",
            "A login banner is configured",
            "generic",
            "show running-config | include banner",
            r"banner (motd|login)",
            Severity::Low,
        ),
        built_in(
            "https-management-only",
            "Web management uses HTTPS rather than HTTP",
            "hp",
            "show running-config | include http",
            r"no ip http server",
            Severity::High,
        ),
        built_in(
            "cdp-disabled-on-external",
            "CDP is not advertised on externally facing interfaces",
            "cisco",
            "show cdp",
            r"CDP is not enabled",
            Severity::Low,
        ),
        built_in(
            "wpa2-enterprise-enforced",
            "Wireless SSIDs require WPA2-Enterprise authentication",
            "aruba",
            "show wlan virtual-ap",
            r"opmode.*wpa2-aes",
            Severity::High,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn catalogue() -> RuleCatalogue {
        RuleCatalogue::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn load_predefined_is_idempotent() {
        let cat = catalogue();
        let first = cat.load_predefined().unwrap();
        assert!(first > 0);
        let second = cat.load_predefined().unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn get_by_vendor_includes_generic_ordered_by_name() {
        let cat = catalogue();
        cat.load_predefined().unwrap();
        let rules = cat.get_by_vendor("cisco").unwrap();
        assert!(rules.iter().all(|r| r.vendor == "cisco" || r.vendor == "generic"));
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn uncompilable_pattern_is_rejected_at_create() {
        let cat = catalogue();
        let rule = built_in("bad", "d", "generic", "cmd", "[invalid", Severity::Low);
        let err = cat.create(rule).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn update_missing_rule_is_not_found() {
        let cat = catalogue();
        let mut rule = built_in("x", "d", "generic", "cmd", "", Severity::Low);
        rule.id = "missing".into();
        let err = cat.update(rule).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
