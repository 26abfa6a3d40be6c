use std::collections::{BTreeMap, HashSet};

use tracing::{debug, instrument};

use egressgateway_core::Family;

use crate::{Driver, Error, Lock, Options, Rule, SharedLock};

/// A chain owned outright by this engine: its kernel contents are replaced
/// wholesale on every apply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rules(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

/// Declarative snapshot of one kernel (table, family) pair.
///
/// Owned chains are rewritten in full; rules placed into built-in chains
/// are tagged with an identity comment and only inserted when the tag is
/// absent from the saved kernel state, so repeated applies (including the
/// periodic drift refresh) converge instead of accumulating duplicates.
pub struct Table {
    pub name: String,
    pub family: Family,
    chain_prefix: String,
    owned: BTreeMap<String, Chain>,
    inserts: BTreeMap<String, Vec<Rule>>,
    driver: Box<dyn Driver>,
    lock: Lock,
    restore_wait: bool,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        family: Family,
        chain_prefix: impl Into<String>,
        options: &Options,
        driver: Box<dyn Driver>,
    ) -> Self {
        let lock = if options.restore_supports_lock {
            Lock::Native
        } else {
            Lock::File(SharedLock::new(
                options.lock_file_path.clone(),
                options.lock_timeout,
                options.lock_probe_interval,
            ))
        };
        Self {
            name: name.into(),
            family,
            chain_prefix: chain_prefix.into(),
            owned: BTreeMap::new(),
            inserts: BTreeMap::new(),
            driver,
            lock,
            restore_wait: options.restore_supports_lock,
        }
    }

    /// Replaces the snapshot of an owned chain.
    pub fn update_chain(&mut self, chain: Chain) {
        self.owned.insert(chain.name.clone(), chain);
    }

    /// Ensures `rules` are present in a built-in chain. A rule byte-equal
    /// to one already requested for that chain is not added twice.
    pub fn insert_or_append_rules(&mut self, chain: impl Into<String>, rules: Vec<Rule>) {
        let pending = self.inserts.entry(chain.into()).or_default();
        for rule in rules {
            if !pending.contains(&rule) {
                pending.push(rule);
            }
        }
    }

    /// Reads kernel state, computes the restore payload, and commits it
    /// atomically for this (table, family).
    #[instrument(skip(self), fields(table = %self.name, family = %self.family))]
    pub fn apply(&mut self) -> Result<(), Error> {
        let _guard = self.lock.acquire()?;

        let saved = self.driver.save(&self.name, self.family)?;
        let kernel = SavedTable::parse(&saved);

        let Some(payload) = self.render(&kernel) else {
            debug!("nothing to apply");
            return Ok(());
        };

        self.driver
            .restore(&self.name, self.family, &payload, self.restore_wait)
    }

    fn render(&self, kernel: &SavedTable) -> Option<String> {
        let mut lines = vec![format!("*{}", self.name)];

        // Owned chains: declare missing ones, then flush and rewrite all.
        for chain in self.owned.values() {
            if !kernel.chains.contains(&chain.name) {
                lines.push(format!(":{} - [0:0]", chain.name));
            }
        }
        for chain in self.owned.values() {
            lines.push(format!("-F {}", chain.name));
        }

        // Built-in chains: drop stale tagged rules, then insert missing
        // ones at the top, preserving their requested order.
        for (chain, rules) in &self.inserts {
            let desired: HashSet<String> = rules
                .iter()
                .map(|r| r.identity(chain, &self.chain_prefix))
                .collect();

            let mut stale: Vec<usize> = kernel
                .rules(chain)
                .iter()
                .enumerate()
                .filter_map(|(i, line)| {
                    let tag = extract_tag(line, &self.chain_prefix)?;
                    (!desired.contains(&tag)).then_some(i + 1)
                })
                .collect();
            stale.reverse();
            for position in stale {
                lines.push(format!("-D {} {}", chain, position));
            }

            for (i, rule) in rules.iter().enumerate() {
                let tag = rule.identity(chain, &self.chain_prefix);
                let present = kernel
                    .rules(chain)
                    .iter()
                    .any(|line| extract_tag(line, &self.chain_prefix).as_deref() == Some(&tag));
                if !present {
                    lines.push(rule.render_insert(chain, i + 1, &self.chain_prefix));
                }
            }
        }

        for chain in self.owned.values() {
            for rule in &chain.rules {
                lines.push(rule.render_append(&chain.name));
            }
        }

        // A payload of just the header would still flush owned chains, so
        // only short-circuit when no chains are managed at all.
        if self.owned.is_empty() && lines.len() == 1 {
            return None;
        }

        lines.push("COMMIT".to_string());
        lines.push(String::new());
        Some(lines.join("\n"))
    }
}

/// A parsed `iptables-save -t <table>` dump.
#[derive(Debug, Default)]
struct SavedTable {
    chains: HashSet<String>,
    appends: BTreeMap<String, Vec<String>>,
}

impl SavedTable {
    fn parse(saved: &str) -> Self {
        let mut out = Self::default();
        for line in saved.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix(':') {
                if let Some(name) = rest.split_whitespace().next() {
                    out.chains.insert(name.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("-A ") {
                if let Some(chain) = rest.split_whitespace().next() {
                    out.appends
                        .entry(chain.to_string())
                        .or_default()
                        .push(line.to_string());
                }
            }
        }
        out
    }

    fn rules(&self, chain: &str) -> &[String] {
        self.appends.get(chain).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Pulls this engine's identity tag out of a saved rule line, tolerating
/// both quoted and unquoted comment rendering.
fn extract_tag(line: &str, chain_prefix: &str) -> Option<String> {
    let start = line.find(chain_prefix)?;
    let tag: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '"')
        .collect();
    Some(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, MatchCriteria};
    use egressgateway_core::Mark;
    use std::sync::{Arc, Mutex};

    /// Serves a canned save dump and records restore payloads.
    struct FakeDriver {
        saved: String,
        restores: Arc<Mutex<Vec<String>>>,
    }

    impl Driver for FakeDriver {
        fn save(&mut self, _table: &str, _family: Family) -> Result<String, Error> {
            Ok(self.saved.clone())
        }

        fn restore(
            &mut self,
            _table: &str,
            _family: Family,
            payload: &str,
            _wait: bool,
        ) -> Result<(), Error> {
            self.restores.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    fn table_with(saved: &str) -> (Table, Arc<Mutex<Vec<String>>>) {
        let restores = Arc::new(Mutex::new(Vec::new()));
        let driver = FakeDriver {
            saved: saved.to_string(),
            restores: restores.clone(),
        };
        let table = Table::new(
            "mangle",
            Family::V4,
            "egw:",
            &Options::default(),
            Box::new(driver),
        );
        (table, restores)
    }

    fn accept_on_mark() -> Rule {
        Rule::new(
            MatchCriteria::new().mark_matches_with_mask(Mark(0x2600_0000), 0xffff_ffff),
            Action::Accept,
        )
    }

    #[test]
    fn declares_flushes_and_rewrites_owned_chains() {
        let saved = "*mangle\n:PREROUTING ACCEPT [0:0]\nCOMMIT\n";
        let (mut table, restores) = table_with(saved);

        table.update_chain(Chain::with_rules(
            "EGRESSGATEWAY-MARK-REQUEST",
            vec![accept_on_mark()],
        ));
        table.apply().unwrap();

        let payload = restores.lock().unwrap()[0].clone();
        assert!(payload.starts_with("*mangle\n"));
        assert!(payload.contains(":EGRESSGATEWAY-MARK-REQUEST - [0:0]"));
        assert!(payload.contains("-F EGRESSGATEWAY-MARK-REQUEST"));
        assert!(payload.contains(
            "-A EGRESSGATEWAY-MARK-REQUEST -m mark --mark 0x26000000/0xffffffff -j ACCEPT"
        ));
        assert!(payload.trim_end().ends_with("COMMIT"));
    }

    #[test]
    fn does_not_redeclare_existing_owned_chain() {
        let saved = "*mangle\n:EGRESSGATEWAY-MARK-REQUEST - [0:0]\nCOMMIT\n";
        let (mut table, restores) = table_with(saved);

        table.update_chain(Chain::new("EGRESSGATEWAY-MARK-REQUEST"));
        table.apply().unwrap();

        let payload = restores.lock().unwrap()[0].clone();
        assert!(!payload.contains(":EGRESSGATEWAY-MARK-REQUEST"));
        assert!(payload.contains("-F EGRESSGATEWAY-MARK-REQUEST"));
    }

    #[test]
    fn inserts_builtin_rule_only_when_tag_absent() {
        let rule = accept_on_mark();
        let tag = rule.identity("POSTROUTING", "egw:");

        let missing = "*mangle\n:POSTROUTING ACCEPT [0:0]\nCOMMIT\n";
        let (mut table, restores) = table_with(missing);
        table.insert_or_append_rules("POSTROUTING", vec![rule.clone()]);
        table.apply().unwrap();
        let payload = restores.lock().unwrap()[0].clone();
        assert!(payload.contains(&format!(
            "-I POSTROUTING 1 -m mark --mark 0x26000000/0xffffffff -j ACCEPT \
             -m comment --comment \"{}\"",
            tag
        )));

        let present = format!(
            "*mangle\n:POSTROUTING ACCEPT [0:0]\n\
             -A POSTROUTING -m mark --mark 0x26000000/0xffffffff \
             -m comment --comment \"{}\" -j ACCEPT\nCOMMIT\n",
            tag
        );
        let (mut table, restores) = table_with(&present);
        table.insert_or_append_rules("POSTROUTING", vec![rule]);
        table.apply().unwrap();
        assert!(
            restores.lock().unwrap().is_empty(),
            "a converged table must not be rewritten"
        );
    }

    #[test]
    fn deletes_stale_tagged_rules_bottom_up() {
        let kept = accept_on_mark();
        let kept_tag = kept.identity("POSTROUTING", "egw:");
        let saved = format!(
            "*mangle\n:POSTROUTING ACCEPT [0:0]\n\
             -A POSTROUTING -m comment --comment \"egw:stale1\" -j ACCEPT\n\
             -A POSTROUTING -m comment --comment \"{}\" -j ACCEPT\n\
             -A POSTROUTING -m comment --comment \"egw:stale2\" -j RETURN\nCOMMIT\n",
            kept_tag
        );
        let (mut table, restores) = table_with(&saved);
        table.insert_or_append_rules("POSTROUTING", vec![kept]);
        table.apply().unwrap();

        let payload = restores.lock().unwrap()[0].clone();
        let d3 = payload.find("-D POSTROUTING 3").expect("deletes rule 3");
        let d1 = payload.find("-D POSTROUTING 1").expect("deletes rule 1");
        assert!(d3 < d1, "higher rule numbers must be deleted first");
        assert!(!payload.contains("-I POSTROUTING"));
    }

    #[test]
    fn untagged_foreign_rules_are_left_alone() {
        let saved = "*mangle\n:POSTROUTING ACCEPT [0:0]\n\
                     -A POSTROUTING -j MASQUERADE\nCOMMIT\n";
        let (mut table, restores) = table_with(saved);
        table.insert_or_append_rules("POSTROUTING", vec![accept_on_mark()]);
        table.apply().unwrap();

        let payload = restores.lock().unwrap()[0].clone();
        assert!(!payload.contains("-D POSTROUTING"));
    }

    #[test]
    fn duplicate_insert_requests_collapse() {
        let (mut table, _) = table_with("*mangle\nCOMMIT\n");
        table.insert_or_append_rules("POSTROUTING", vec![accept_on_mark()]);
        table.insert_or_append_rules("POSTROUTING", vec![accept_on_mark()]);
        assert_eq!(table.inserts["POSTROUTING"].len(), 1);
    }
}
