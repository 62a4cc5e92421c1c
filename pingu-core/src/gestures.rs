// Named UI-interaction gestures carried on a testcase.
//
// Grounded on `src/bot/fuzzing/gesture_handler.py` in the original source:
// a gesture is an opaque, named interaction (e.g. "click", "rotate:left")
// replayed verbatim alongside a testcase on every reproduction attempt, so
// the bot never has to understand what a gesture does, only that it must be
// carried through unchanged.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct GestureSet(Vec<String>);

impl GestureSet {
    pub fn new(gestures: Vec<String>) -> Self {
        Self(gestures)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for GestureSet {
    fn from(gestures: Vec<String>) -> Self {
        Self(gestures)
    }
}

impl IntoIterator for GestureSet {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gesture_set_roundtrip() {
        let gestures = GestureSet::new(vec!["click".to_owned(), "rotate:left".to_owned()]);
        let json = serde_json::to_string(&gestures).unwrap();
        let parsed: GestureSet = serde_json::from_str(&json).unwrap();
        assert_eq!(gestures, parsed);
    }

    #[test]
    fn test_gesture_set_empty() {
        assert!(GestureSet::default().is_empty());
    }
}
