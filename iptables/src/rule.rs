use egressgateway_core::Mark;
use sha1::{Digest, Sha1};

/// Builds the match half of a rule as ordered `iptables` argument
/// fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCriteria(Vec<String>);

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_ip_set(mut self, set: &str) -> Self {
        self.0.push(format!("-m set --match-set {} src", set));
        self
    }

    pub fn dest_ip_set(mut self, set: &str) -> Self {
        self.0.push(format!("-m set --match-set {} dst", set));
        self
    }

    pub fn not_dest_ip_set(mut self, set: &str) -> Self {
        self.0.push(format!("-m set ! --match-set {} dst", set));
        self
    }

    /// Matches only packets in the first-observed direction of their
    /// connection, so reply traffic is never marked or NATed.
    pub fn ct_direction_original(mut self) -> Self {
        self.0.push("-m conntrack --ctdir ORIGINAL".to_string());
        self
    }

    pub fn mark_matches_with_mask(mut self, mark: Mark, mask: u32) -> Self {
        self.0
            .push(format!("-m mark --mark {}/{:#010x}", mark, mask));
        self
    }

    fn render(&self) -> String {
        self.0.join(" ")
    }
}

/// The action half of a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Jump(String),
    SetMaskedMark { mark: Mark, mask: u32 },
    Snat { to: String },
}

impl Action {
    fn render(&self) -> String {
        match self {
            Action::Accept => "-j ACCEPT".to_string(),
            Action::Jump(target) => format!("-j {}", target),
            Action::SetMaskedMark { mark, mask } => {
                format!("-j MARK --set-xmark {}/{:#010x}", mark, mask)
            }
            Action::Snat { to } => format!("-j SNAT --to-source {}", to),
        }
    }
}

/// One packet-filter rule: match criteria, an action, and an optional
/// operator-facing comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub match_criteria: MatchCriteria,
    pub action: Action,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(match_criteria: MatchCriteria, action: Action) -> Self {
        Self {
            match_criteria,
            action,
            comment: None,
        }
    }

    /// The rule spec without a chain: match fragments, comments, action.
    pub fn spec(&self) -> String {
        let mut parts = Vec::new();
        let matches = self.match_criteria.render();
        if !matches.is_empty() {
            parts.push(matches);
        }
        if let Some(comment) = &self.comment {
            parts.push(format!("-m comment --comment \"{}\"", comment));
        }
        parts.push(self.action.render());
        parts.join(" ")
    }

    /// An append line for a chain this engine owns outright.
    pub fn render_append(&self, chain: &str) -> String {
        format!("-A {} {}", chain, self.spec())
    }

    /// An insert line for a built-in chain, tagged with this rule's
    /// identity hash so later applies can recognize it in kernel state.
    pub fn render_insert(&self, chain: &str, position: usize, chain_prefix: &str) -> String {
        format!(
            "-I {} {} {} -m comment --comment \"{}\"",
            chain,
            position,
            self.spec(),
            self.identity(chain, chain_prefix),
        )
    }

    /// A stable identity for this rule within a chain. `iptables-save`
    /// normalizes rule text, so presence checks key on this tag (carried in
    /// a comment) rather than on byte equality of the whole line.
    pub fn identity(&self, chain: &str, chain_prefix: &str) -> String {
        let digest = Sha1::digest(format!("{}:{}", chain, self.spec()).as_bytes());
        let mut tag = String::with_capacity(chain_prefix.len() + 16);
        tag.push_str(chain_prefix);
        for byte in digest.iter().take(8) {
            tag.push_str(&format!("{:02x}", byte));
        }
        tag
    }
}
