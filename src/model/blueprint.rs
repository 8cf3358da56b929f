use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Top-level structured plan for a novel. Exactly one per project; replaced
/// wholesale when the blueprint is regenerated or refined.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Blueprint {
    pub title: String,
    pub genre: String,
    pub style: String,
    pub tone: String,
    pub target_audience: String,
    pub one_sentence_summary: String,
    pub full_synopsis: String,
    /// Free-form world keys (key_locations, power_system, factions, ...).
    /// Unknown keys are kept as-is so downstream rendering never loses them.
    #[serde(default)]
    pub world_setting: Map<String, Value>,
    #[serde(default)]
    pub needs_part_outlines: bool,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub chapters_per_part: u32,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub goals: String,
    #[serde(default)]
    pub abilities: String,
    #[serde(default)]
    pub relationship_to_protagonist: String,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Relationship {
    pub character_from: String,
    pub character_to: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub position: u32,
}

impl Blueprint {
    /// Names of the key locations declared in world_setting, if any.
    /// Accepts both a plain string array and an object keyed by name.
    pub fn key_locations(&self) -> Vec<String> {
        match self.world_setting.get("key_locations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => obj
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::Object(obj)) => obj.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for Character {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}。性格: {}。目标: {}。能力: {}。与主角关系: {}",
            self.name,
            self.identity,
            self.personality,
            self.goals,
            self.abilities,
            self.relationship_to_protagonist
        )
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {}: {}",
            self.character_from, self.character_to, self.description
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_locations_from_array() {
        let mut bp = Blueprint::default();
        bp.world_setting.insert(
            "key_locations".to_string(),
            json!(["青云宗", {"name": "万兽山脉", "description": "凶兽横行"}]),
        );
        assert_eq!(bp.key_locations(), vec!["青云宗", "万兽山脉"]);
    }

    #[test]
    fn key_locations_from_object() {
        let mut bp = Blueprint::default();
        bp.world_setting.insert(
            "key_locations".to_string(),
            json!({"藏经阁": "宗门禁地"}),
        );
        assert_eq!(bp.key_locations(), vec!["藏经阁"]);
    }
}
