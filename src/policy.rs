use crate::types::{
    Backend, BotGuardConfig, GlobalConfig, RateLimitConfig, RoutePolicy, RouteStrategy,
    StickyConfig,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// A policy with its glob pre-compiled and method list normalised.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: RoutePolicy,
    pattern: Regex,
    methods: Option<HashSet<String>>,
}

impl CompiledPolicy {
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(&method.to_ascii_uppercase()) {
                return false;
            }
        }
        self.pattern.is_match(path)
    }
}

/// One config snapshot compiled for request-path work: enabled policies in
/// descending priority order, backends indexed by id.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub config: GlobalConfig,
    policies: Vec<CompiledPolicy>,
    backend_index: HashMap<String, usize>,
}

/// Effective knobs for one request after policy resolution.
#[derive(Debug, Clone)]
pub struct EffectiveRoute {
    pub policy_id: String,
    pub rate_limit: RateLimitConfig,
    pub bot_guard: BotGuardConfig,
    pub strategy: RouteStrategy,
    pub sticky: Option<StickyConfig>,
    pub backends: Vec<Backend>,
    pub ip_allowlist: Vec<String>,
    pub ip_blocklist: Vec<String>,
}

impl CompiledConfig {
    pub fn compile(config: GlobalConfig) -> Self {
        let mut backend_index = HashMap::new();
        for (idx, backend) in config.backends.iter().enumerate() {
            backend_index.insert(backend.id.clone(), idx);
        }

        let mut policies = Vec::new();
        for policy in config.policies.iter().filter(|p| p.enabled) {
            let pattern = match compile_glob(&policy.path_pattern) {
                Ok(re) => re,
                Err(err) => {
                    tracing::warn!(
                        policy = %policy.id,
                        pattern = %policy.path_pattern,
                        %err,
                        "skipping policy with unparseable path pattern"
                    );
                    continue;
                }
            };
            for id in &policy.backend_ids {
                if !backend_index.contains_key(id) {
                    tracing::warn!(policy = %policy.id, backend = %id, "policy references unknown backend");
                }
            }
            let methods = policy.methods.as_ref().map(|list| {
                list.iter()
                    .map(|m| m.to_ascii_uppercase())
                    .collect::<HashSet<_>>()
            });
            policies.push(CompiledPolicy {
                policy: policy.clone(),
                pattern,
                methods,
            });
        }
        policies.sort_by(|a, b| b.policy.priority.cmp(&a.policy.priority));

        if !config.default_bot_guard.thresholds.is_valid() {
            tracing::warn!(domain = %config.domain, "default bot-guard thresholds out of order");
        }

        Self {
            config,
            policies,
            backend_index,
        }
    }

    /// Highest-priority enabled policy whose glob and method match.
    pub fn match_policy(&self, path: &str, method: &str) -> Option<&CompiledPolicy> {
        self.policies.iter().find(|p| p.matches(path, method))
    }

    /// Resolve the effective knobs for a request: the matched policy's own
    /// settings, falling back to the config-level defaults and the union of
    /// all backends when nothing matched. Dangling backend ids resolve to
    /// nothing rather than failing the request.
    pub fn resolve(&self, matched: Option<&CompiledPolicy>) -> EffectiveRoute {
        match matched {
            Some(compiled) => {
                let p = &compiled.policy;
                let backends = p
                    .backend_ids
                    .iter()
                    .filter_map(|id| self.backend_index.get(id))
                    .map(|idx| self.config.backends[*idx].clone())
                    .collect();
                EffectiveRoute {
                    policy_id: p.id.clone(),
                    rate_limit: p
                        .rate_limit
                        .clone()
                        .unwrap_or_else(|| self.config.default_rate_limit.clone()),
                    bot_guard: p
                        .bot_guard
                        .clone()
                        .unwrap_or_else(|| self.config.default_bot_guard.clone()),
                    strategy: p.strategy,
                    sticky: p.sticky_config.clone(),
                    backends,
                    ip_allowlist: p.ip_allowlist.clone().unwrap_or_default(),
                    ip_blocklist: p.ip_blocklist.clone().unwrap_or_default(),
                }
            }
            None => EffectiveRoute {
                policy_id: "default".to_string(),
                rate_limit: self.config.default_rate_limit.clone(),
                bot_guard: self.config.default_bot_guard.clone(),
                strategy: self.config.default_strategy,
                sticky: None,
                backends: self.config.backends.clone(),
                ip_allowlist: Vec::new(),
                ip_blocklist: Vec::new(),
            },
        }
    }
}

/// Glob-to-regex translation: `**` crosses `/`, `*` stays within a segment,
/// everything else is literal. `/**` and `/*` both match every path.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern == "/**" || pattern == "/*" {
        return Regex::new("^/.*$");
    }
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '?' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    Regex::new(&out)
}
