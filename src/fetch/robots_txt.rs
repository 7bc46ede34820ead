//! robots.txt parsing and rule evaluation.
//!
//! Supports `User-agent` groups (consecutive agent lines share one rule set),
//! `Allow`, `Disallow`, `Crawl-delay`, `Sitemap` and `#` comments. Keys are
//! case-insensitive. Path rules are prefix matches; wildcards in rules only
//! matter once converted for the URL filter by [`convert_pattern_to_regex`].

/// Rules for one user-agent pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    user_agent: String,
    allows: Vec<String>,
    disallows: Vec<String>,
    crawl_delay: u64,
}

impl Directive {
    /// Creates an empty directive for `user_agent` (`*` for everyone).
    #[must_use]
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            allows: Vec::new(),
            disallows: Vec::new(),
            crawl_delay: 0,
        }
    }

    /// The user-agent pattern.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Allow path patterns, in file order.
    #[must_use]
    pub fn allows(&self) -> &[String] {
        &self.allows
    }

    /// Disallow path patterns, in file order.
    #[must_use]
    pub fn disallows(&self) -> &[String] {
        &self.disallows
    }

    /// Crawl delay in seconds (0 when unset).
    #[must_use]
    pub fn crawl_delay(&self) -> u64 {
        self.crawl_delay
    }

    pub fn add_allow(&mut self, path: impl Into<String>) {
        self.allows.push(path.into());
    }

    pub fn add_disallow(&mut self, path: impl Into<String>) {
        self.disallows.push(path.into());
    }

    pub fn set_crawl_delay(&mut self, seconds: u64) {
        self.crawl_delay = seconds;
    }

    /// Returns true if `path` may be crawled under this directive.
    ///
    /// A matching allow wins over any matching disallow.
    #[must_use]
    pub fn allows_path(&self, path: &str) -> bool {
        if self.allows.iter().any(|p| path.starts_with(p.as_str())) {
            return true;
        }
        !self.disallows.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// How specifically this directive's pattern matches `user_agent`, or
    /// `None` when it does not match. Longer patterns are more specific; `*`
    /// scores zero.
    fn match_score(&self, user_agent: &str) -> Option<usize> {
        let pattern = self.user_agent.trim().to_ascii_lowercase();
        if pattern == "*" {
            return Some(0);
        }
        if pattern.is_empty() {
            return None;
        }
        let agent = user_agent.to_ascii_lowercase();
        glob_find(&pattern, &agent).then(|| pattern.trim_matches('*').len().max(1))
    }
}

/// Returns true if `pattern` (with `*` wildcards) occurs anywhere in `text`.
fn glob_find(pattern: &str, text: &str) -> bool {
    let mut rest = text;
    for part in pattern.split('*').filter(|p| !p.is_empty()) {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

/// A parsed robots.txt file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsTxt {
    directives: Vec<Directive>,
    sitemaps: Vec<String>,
}

impl RobotsTxt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses robots.txt content. Unknown and malformed lines are skipped.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::new();
        // Indices into `robots.directives` of the group being built.
        let mut group: Vec<usize> = Vec::new();
        let mut group_has_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if group_has_rules {
                        group.clear();
                        group_has_rules = false;
                    }
                    if value.is_empty() {
                        continue;
                    }
                    let index = robots
                        .directives
                        .iter()
                        .position(|d| d.user_agent.eq_ignore_ascii_case(value))
                        .unwrap_or_else(|| {
                            robots.directives.push(Directive::new(value));
                            robots.directives.len() - 1
                        });
                    group.push(index);
                }
                "disallow" => {
                    group_has_rules = true;
                    if !value.is_empty() {
                        for &i in &group {
                            robots.directives[i].add_disallow(value);
                        }
                    }
                }
                "allow" => {
                    group_has_rules = true;
                    if !value.is_empty() {
                        for &i in &group {
                            robots.directives[i].add_allow(value);
                        }
                    }
                }
                "crawl-delay" => {
                    group_has_rules = true;
                    if let Some(delay) = parse_crawl_delay(value) {
                        for &i in &group {
                            robots.directives[i].set_crawl_delay(delay);
                        }
                    }
                }
                "sitemap" => robots.add_sitemap(value),
                _ => {}
            }
        }
        robots
    }

    /// Adds a directive, replacing an existing one for the same agent pattern.
    pub fn add_directive(&mut self, directive: Directive) {
        match self
            .directives
            .iter_mut()
            .find(|d| d.user_agent.eq_ignore_ascii_case(&directive.user_agent))
        {
            Some(existing) => *existing = directive,
            None => self.directives.push(directive),
        }
    }

    /// Adds a sitemap URL unless blank or already known.
    pub fn add_sitemap(&mut self, url: &str) {
        if !url.is_empty() && !self.sitemaps.iter().any(|s| s == url) {
            self.sitemaps.push(url.to_string());
        }
    }

    /// All directives, in file order.
    #[must_use]
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Sitemap URLs, in file order without duplicates.
    #[must_use]
    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }

    /// The directive declared for exactly `user_agent` (case-insensitive).
    #[must_use]
    pub fn directive(&self, user_agent: &str) -> Option<&Directive> {
        self.directives
            .iter()
            .find(|d| d.user_agent.eq_ignore_ascii_case(user_agent))
    }

    /// The most specific directive whose pattern matches `user_agent`, falling
    /// back to `*`.
    #[must_use]
    pub fn matched_directive(&self, user_agent: &str) -> Option<&Directive> {
        self.directives
            .iter()
            .filter_map(|d| d.match_score(user_agent).map(|score| (score, d)))
            .fold(None, |best: Option<(usize, &Directive)>, (score, d)| match best {
                Some((best_score, _)) if best_score >= score => best,
                _ => Some((score, d)),
            })
            .map(|(_, d)| d)
    }

    /// Returns true if `path` may be crawled by `user_agent`.
    #[must_use]
    pub fn allows(&self, path: &str, user_agent: &str) -> bool {
        self.matched_directive(user_agent)
            .is_none_or(|d| d.allows_path(path))
    }

    /// Crawl delay in seconds for `user_agent` (0 when unset).
    #[must_use]
    pub fn crawl_delay(&self, user_agent: &str) -> u64 {
        self.matched_directive(user_agent)
            .map_or(0, Directive::crawl_delay)
    }
}

fn parse_crawl_delay(value: &str) -> Option<u64> {
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|d| *d >= 0.0).map(|d| d.ceil() as u64))
}

/// Converts a robots.txt path rule into a URL filter regular expression.
///
/// Literal `.` and `?` are escaped and `*` becomes `.*`. Rules not starting
/// with `/` match anywhere; rules not ending in `$` or `*` match any suffix.
#[must_use]
pub fn convert_pattern_to_regex(pattern: &str) -> String {
    let mut regex = pattern
        .replace('.', "\\.")
        .replace('?', "\\?")
        .replace('*', ".*");
    if !regex.starts_with('/') {
        regex.insert_str(0, ".*");
    }
    if !regex.ends_with('$') && !regex.ends_with(".*") {
        regex.push_str(".*");
    }
    while regex.contains(".*.*") {
        regex = regex.replace(".*.*", ".*");
    }
    regex
}
