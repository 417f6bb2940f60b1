use super::Range;
use crate::work::WorkId;

/// Store key layout shared by every client of one dataset namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(namespace: &str) -> Self {
        let trimmed = namespace.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { prefix }
    }

    pub fn item_lock(&self, id: &WorkId) -> String {
        format!("{}locks/{id}.json", self.prefix)
    }

    pub fn item_done(&self, id: &WorkId) -> String {
        format!("{}done/{id}", self.prefix)
    }

    pub fn range_lock(&self, range: &Range) -> String {
        format!("{}ranges/locks/{}.json", self.prefix, range.label())
    }

    pub fn range_done(&self, range: &Range) -> String {
        format!("{}ranges/done/{}", self.prefix, range.label())
    }

    pub fn range_progress(&self, range: &Range) -> String {
        format!("{}ranges/progress/{}.json", self.prefix, range.label())
    }

    pub fn range_abandoned(&self, range: &Range) -> String {
        format!("{}ranges/abandoned/{}.json", self.prefix, range.label())
    }

    pub fn done_prefix(&self) -> String {
        format!("{}ranges/done_prefix.json", self.prefix)
    }

    pub fn artifact(&self, id: &WorkId, file_name: &str) -> String {
        format!("{}artifacts/{id}/{file_name}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::KeyLayout;
    use crate::coordination::Range;
    use crate::work::WorkId;

    #[test]
    fn keys_are_namespaced() {
        let keys = KeyLayout::new("/unsplash/");
        let id = WorkId::parse("abc").expect("id");
        let range = Range::at_index(1, 300);

        assert_eq!(keys.item_lock(&id), "unsplash/locks/abc.json");
        assert_eq!(keys.item_done(&id), "unsplash/done/abc");
        assert_eq!(keys.range_lock(&range), "unsplash/ranges/locks/300-600.json");
        assert_eq!(keys.range_done(&range), "unsplash/ranges/done/300-600");
        assert_eq!(keys.artifact(&id, "abc.ply"), "unsplash/artifacts/abc/abc.ply");
        assert_eq!(KeyLayout::new("").done_prefix(), "ranges/done_prefix.json");
    }
}
