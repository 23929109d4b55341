//! Rewrites DWARF-reported source paths against a configurable set of
//! prefix substitutions, so a trace captured on a build machine resolves
//! against sources checked out somewhere else on the host doing the
//! decoding.
//!
//! Each rule is tried in order; the first whose `from` prefix matches
//! wins. A path with no matching rule is returned unchanged.

#[derive(Debug, Clone)]
pub struct PathRewriteRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    rules: Vec<PathRewriteRule>,
}

impl PathRewriter {
    pub fn new(rules: Vec<PathRewriteRule>) -> Self {
        PathRewriter { rules }
    }

    pub fn rewrite(&self, path: &str) -> String {
        for rule in &self.rules {
            if let Some(rest) = path.strip_prefix(rule.from.as_str()) {
                let mut out = rule.to.clone();
                out.push_str(rest);
                return out;
            }
        }
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_matching_prefix() {
        let rewriter = PathRewriter::new(vec![PathRewriteRule {
            from: "/build/src".into(),
            to: "/home/dev/project".into(),
        }]);
        assert_eq!(
            rewriter.rewrite("/build/src/main.c"),
            "/home/dev/project/main.c"
        );
    }

    #[test]
    fn leaves_unmatched_paths_alone() {
        let rewriter = PathRewriter::new(vec![PathRewriteRule {
            from: "/build/src".into(),
            to: "/home/dev/project".into(),
        }]);
        assert_eq!(rewriter.rewrite("/usr/include/stdio.h"), "/usr/include/stdio.h");
    }

    #[test]
    fn first_matching_rule_wins() {
        let rewriter = PathRewriter::new(vec![
            PathRewriteRule {
                from: "/build".into(),
                to: "/A".into(),
            },
            PathRewriteRule {
                from: "/build/src".into(),
                to: "/B".into(),
            },
        ]);
        assert_eq!(rewriter.rewrite("/build/src/x.c"), "/A/src/x.c");
    }
}
