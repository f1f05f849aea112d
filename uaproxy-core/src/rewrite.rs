//! Rewrite policies: leave traffic alone, replace every User-Agent, or run
//! the configured rule lists.

use crate::metadata::Metadata;
use crate::rule::{Engine, RuleSet};
use regex::{NoExpand, Regex};
use tracing::{debug, info, warn};
use uaproxy_config::{Config, Direction, RewriteMode};

pub use crate::rule::Verdict;

const USER_AGENT: &str = "User-Agent";
const STEAM_CLIENT: &str = "Valve/Steam HTTP Client 1.0";

/// Agents that break when their User-Agent changes.
const WHITELIST: &[&str] = &[
    "MicroMessenger Client",
    "Bilibili Freedoooooom/MarkII",
    STEAM_CLIENT,
    "Go-http-client/1.1",
    "ByteDancePcdn",
];

/// What the orchestrator should do with the message it just handed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteDecision {
    pub verdict: Verdict,
    /// Remember the destination as not worth sniffing.
    pub need_cache: bool,
    /// Stop rewriting the rest of this connection.
    pub need_skip: bool,
    /// A reply was synthesized for the client and is waiting in the metadata.
    pub redirect: bool,
    /// The message bytes changed.
    pub modified: bool,
}

#[derive(Debug)]
pub enum Rewriter {
    Direct,
    Global(GlobalRewriter),
    Rule(RuleRewriter),
}

impl Rewriter {
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        let rewriter = match config.rewrite_mode {
            RewriteMode::Direct => Rewriter::Direct,
            RewriteMode::Global => Rewriter::Global(GlobalRewriter::from_config(config)?),
            RewriteMode::Rule => Rewriter::Rule(RuleRewriter::from_config(config)),
        };
        info!(mode = rewriter.mode().as_str(), "Rewriter initialized");
        Ok(rewriter)
    }

    pub fn mode(&self) -> RewriteMode {
        match self {
            Rewriter::Direct => RewriteMode::Direct,
            Rewriter::Global(_) => RewriteMode::Global,
            Rewriter::Rule(_) => RewriteMode::Rule,
        }
    }

    /// Whether responses need to be parsed at all.
    pub fn serves_response(&self) -> bool {
        match self {
            Rewriter::Rule(rules) => rules.serves(Direction::Response),
            Rewriter::Direct | Rewriter::Global(_) => false,
        }
    }

    /// Whether bodies travelling in `direction` should be buffered for rules.
    pub fn needs_body(&self, direction: Direction) -> bool {
        match self {
            Rewriter::Rule(rules) => rules.body.serves(direction),
            Rewriter::Direct | Rewriter::Global(_) => false,
        }
    }

    pub fn rewrite_request(&self, meta: &mut Metadata) -> RewriteDecision {
        match self {
            Rewriter::Direct => RewriteDecision::default(),
            Rewriter::Global(global) => global.rewrite_request(meta),
            Rewriter::Rule(rules) => rules.rewrite_request(meta),
        }
    }

    pub fn rewrite_response(&self, meta: &mut Metadata) -> RewriteDecision {
        match self {
            Rewriter::Rule(rules) => rules.rewrite_response(meta),
            Rewriter::Direct | Rewriter::Global(_) => RewriteDecision::default(),
        }
    }
}

/// Replaces the User-Agent of every request outside the whitelist.
#[derive(Debug)]
pub struct GlobalRewriter {
    user_agent: String,
    regex: Option<Regex>,
    partial_replace: bool,
    preserve_length: bool,
}

impl GlobalRewriter {
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        let regex = match config.user_agent_regex.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(&format!("(?i){}", pattern))?),
            _ => None,
        };
        Ok(Self {
            user_agent: config.user_agent.clone(),
            regex,
            partial_replace: config.partial_replace,
            preserve_length: config.preserve_length,
        })
    }

    pub fn rewrite_request(&self, meta: &mut Metadata) -> RewriteDecision {
        let mut decision = RewriteDecision::default();
        let original = meta.user_agent().to_string();
        if original.is_empty() {
            return decision;
        }

        if WHITELIST.contains(&original.as_str()) {
            debug!(src = meta.src_addr(), dest = meta.dest_addr(), user_agent = %original, "User-Agent whitelisted");
            decision.need_cache = true;
            decision.need_skip = original == STEAM_CLIENT;
            return decision;
        }

        let rewritten = match &self.regex {
            Some(regex) if !regex.is_match(&original) => return decision,
            Some(regex) if self.partial_replace => regex
                .replace_all(&original, NoExpand(&self.user_agent))
                .into_owned(),
            _ => self.user_agent.clone(),
        };

        let Some(head) = meta.request_mut() else {
            return decision;
        };
        let result = if self.preserve_length {
            head.overwrite_header_fixed(USER_AGENT, &rewritten).map(|_| ())
        } else {
            head.set_header(USER_AGENT, &rewritten)
        };

        match result {
            Ok(()) => {
                meta.record_edit(USER_AGENT, original, rewritten);
                decision.modified = true;
            }
            Err(e) => warn!(
                src = meta.src_addr(),
                dest = meta.dest_addr(),
                error = %e,
                "User-Agent rewrite failed"
            ),
        }
        decision
    }
}

/// Runs the body, header and redirect rule lists.
#[derive(Debug)]
pub struct RuleRewriter {
    pub header: Engine,
    pub body: Engine,
    pub redirect: Engine,
}

impl RuleRewriter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            header: Engine::from_configs(&config.header_rules, RuleSet::Header),
            body: Engine::from_configs(&config.body_rules, RuleSet::Body),
            redirect: Engine::from_configs(&config.redirect_rules, RuleSet::Redirect),
        }
    }

    pub fn serves(&self, direction: Direction) -> bool {
        self.header.serves(direction)
            || self.body.serves(direction)
            || (direction == Direction::Request && self.redirect.serves(direction))
    }

    pub fn rewrite_request(&self, meta: &mut Metadata) -> RewriteDecision {
        self.run(meta, &[&self.body, &self.header, &self.redirect])
    }

    pub fn rewrite_response(&self, meta: &mut Metadata) -> RewriteDecision {
        self.run(meta, &[&self.body, &self.header])
    }

    fn run(&self, meta: &mut Metadata, engines: &[&Engine]) -> RewriteDecision {
        let mut decision = RewriteDecision::default();

        for engine in engines {
            let evaluation = engine.evaluate(meta);
            decision.need_cache |= evaluation.need_cache;
            if evaluation.verdict != Verdict::Forward {
                decision.verdict = evaluation.verdict;
                break;
            }
            if meta.has_reply() {
                decision.redirect = true;
                break;
            }
        }

        decision.modified = meta.is_modified();
        decision
    }
}
