//! Ordered rule lists: a matcher, an action, and whether evaluation goes on
//! after the action fires.

mod action;
mod matcher;

pub use action::{Action, ActionError};
pub use matcher::Matcher;

use crate::metadata::Metadata;
use thiserror::Error;
use tracing::{debug, info, warn};
use uaproxy_config::{Direction, RuleConfig};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule type: {0}")]
    UnknownType(String),
    #[error("unknown or unsupported action: {0}")]
    UnknownAction(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Which configured list a rule comes from. Each list accepts its own set
/// of actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSet {
    Header,
    Body,
    Redirect,
}

impl RuleSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSet::Header => "header",
            RuleSet::Body => "body",
            RuleSet::Redirect => "redirect",
        }
    }
}

/// What happens to the message after rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Forward,
    Drop,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: Matcher,
    pub action: Action,
    /// Keep evaluating later rules after this one fires
    pub chain: bool,
    /// Ask for the destination to be cached as not worth sniffing
    pub cache: bool,
    pub direction: Direction,
}

impl Rule {
    pub fn from_config(config: &RuleConfig, set: RuleSet) -> Result<Self, RuleError> {
        let direction = match set {
            RuleSet::Redirect => Direction::Request,
            RuleSet::Header | RuleSet::Body => config.direction,
        };
        Ok(Self {
            matcher: Matcher::from_config(config)?,
            action: Action::from_config(config, set)?,
            chain: config.chain,
            cache: config.cache,
            direction,
        })
    }

    pub fn applies_to(&self, direction: Direction) -> bool {
        self.direction == Direction::Dual || self.direction == direction
    }

    /// Runs the action; the result says whether evaluation resumes at the
    /// next rule.
    pub fn execute(&self, meta: &mut Metadata) -> Result<bool, ActionError> {
        let continues = self.action.execute(meta)?;
        Ok(self.chain && continues)
    }

    pub fn verdict(&self) -> Verdict {
        match self.action {
            Action::Drop => Verdict::Drop,
            Action::Reject => Verdict::Reject,
            _ => Verdict::Forward,
        }
    }
}

/// Result of running one engine over a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub need_cache: bool,
    /// Number of rules whose action ran.
    pub executed: usize,
}

#[derive(Debug, Clone)]
pub struct Engine {
    set: RuleSet,
    rules: Vec<Rule>,
    serves_request: bool,
    serves_response: bool,
}

impl Engine {
    pub fn new(set: RuleSet, rules: Vec<Rule>) -> Self {
        let serves = |direction| rules.iter().any(|rule: &Rule| rule.applies_to(direction));
        Self {
            set,
            serves_request: serves(Direction::Request),
            serves_response: serves(Direction::Response),
            rules,
        }
    }

    /// Compiles a configured rule list. Disabled rules are left out and
    /// invalid ones are dropped with a warning.
    pub fn from_configs(configs: &[RuleConfig], set: RuleSet) -> Self {
        let mut rules = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            if !config.enabled {
                debug!(set = set.as_str(), index, "Skipping disabled rule");
                continue;
            }
            match Rule::from_config(config, set) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(
                    set = set.as_str(),
                    index,
                    kind = %config.kind,
                    action = %config.action,
                    error = %e,
                    "Rule disabled"
                ),
            }
        }

        let engine = Self::new(set, rules);
        info!(
            set = set.as_str(),
            rules = engine.len(),
            serve_request = engine.serves_request,
            serve_response = engine.serves_response,
            "Rule engine initialized"
        );
        engine
    }

    pub fn set(&self) -> RuleSet {
        self.set
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn serves(&self, direction: Direction) -> bool {
        match direction {
            Direction::Request => self.serves_request,
            Direction::Response => self.serves_response,
            Direction::Dual => self.serves_request || self.serves_response,
        }
    }

    /// First rule at or after `start` that applies to `direction` and
    /// matches `meta`.
    pub fn match_rule(
        &self,
        meta: &Metadata,
        start: usize,
        direction: Direction,
    ) -> Option<(&Rule, usize)> {
        self.rules
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, rule)| rule.applies_to(direction) && rule.matcher.matches(meta))
            .map(|(index, rule)| (rule, index))
    }

    /// Evaluates the list against the message in `meta`, following chains
    /// until an action stops them.
    pub fn evaluate(&self, meta: &mut Metadata) -> Evaluation {
        let direction = meta.direction();
        let mut evaluation = Evaluation::default();
        let mut start = 0;

        while let Some((rule, index)) = self.match_rule(meta, start, direction) {
            debug!(
                set = self.set.as_str(),
                index,
                matcher = rule.matcher.kind(),
                action = rule.action.kind(),
                "Rule matched"
            );
            evaluation.need_cache |= rule.cache;
            evaluation.verdict = rule.verdict();
            evaluation.executed += 1;

            match rule.execute(meta) {
                Ok(true) => start = index + 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(
                        set = self.set.as_str(),
                        index,
                        action = rule.action.kind(),
                        src = meta.src_addr(),
                        dest = meta.dest_addr(),
                        error = %e,
                        "Rule action failed"
                    );
                    break;
                }
            }
        }

        evaluation
    }
}
