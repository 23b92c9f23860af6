use crate::errors::ConfigurationError;
use crate::story::{Story, StoryId, discover_epics, load_stories};
use std::path::Path;

/// An ordered group of stories sharing an epic number.
#[derive(Debug, Clone)]
pub struct Epic {
    pub id: u32,
    pub stories: Vec<Story>,
}

impl Epic {
    /// Discover the stories of `id` in `stories_dir`.
    pub fn load(stories_dir: &Path, id: u32) -> Result<Self, ConfigurationError> {
        let known = discover_epics(stories_dir)?;
        if !known.is_empty() && !known.iter().any(|(epic, _)| *epic == id) {
            let list: Vec<String> = known.iter().map(|(epic, _)| epic.to_string()).collect();
            return Err(ConfigurationError::UnknownEpic {
                epic: id,
                known: list.join(", "),
            });
        }
        let stories = load_stories(stories_dir, id)?;
        Ok(Self { id, stories })
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    pub fn index_of(&self, id: StoryId) -> Option<usize> {
        self.stories.iter().position(|s| s.id == id)
    }

    pub fn scope(&self) -> String {
        format!("epic-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_story(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_load_orders_stories_numerically() {
        let dir = tempdir().unwrap();
        write_story(dir.path(), "3.10-last.md", "# Last");
        write_story(dir.path(), "3.2-second.md", "# Second");
        write_story(dir.path(), "3.1-first.md", "# First");
        write_story(dir.path(), "4.1-other.md", "# Other epic");

        let epic = Epic::load(dir.path(), 3).unwrap();
        let numbers: Vec<u32> = epic.stories.iter().map(|s| s.id.number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert_eq!(epic.index_of(StoryId::new(3, 10)), Some(2));
        assert_eq!(epic.scope(), "epic-3");
    }

    #[test]
    fn test_unknown_epic_lists_known() {
        let dir = tempdir().unwrap();
        write_story(dir.path(), "1.1-a.md", "# A");
        write_story(dir.path(), "2.1-b.md", "# B");
        let err = Epic::load(dir.path(), 9).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownEpic { epic: 9, .. }));
        assert!(err.to_string().contains("1, 2"));
    }

    #[test]
    fn test_empty_dir_has_no_stories() {
        let dir = tempdir().unwrap();
        let err = Epic::load(dir.path(), 1).unwrap_err();
        assert!(matches!(err, ConfigurationError::NoStories { epic: 1, .. }));
    }

    #[test]
    fn test_missing_dir() {
        let dir = tempdir().unwrap();
        let err = Epic::load(&dir.path().join("nope"), 1).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingStoriesDir(_)));
    }
}
