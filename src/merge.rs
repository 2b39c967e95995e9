//! Volume merger.
//!
//! Combines the successful section outcomes of one volume into a single
//! [`VolumeRecord`]:
//!
//! - `time_anchors` are concatenated as-is.
//! - `people` and `places` are upserted by normalized name. The first
//!   occurrence is the base record; later ones union their `aliases`,
//!   `roles`, `offices` and `evidence` lists into it.
//! - `relations` dedup on `type|from|to|relation|evidence` (with `from` and
//!   `to` normalized); the first occurrence is kept.
//! - `events` dedup on `event_name|time|place|evidence[0]`; the first
//!   occurrence is kept with its participants normalized.
//!
//! The merge is a pure function of its input order, apart from
//! `generated_at`.

use chrono::Utc;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::extraction::Extraction;
use crate::models::{SectionOutcome, VolumeMeta, VolumeRecord};

/// List-valued entity attributes unioned across occurrences.
const UNION_FIELDS: [&str; 4] = ["aliases", "roles", "offices", "evidence"];

/// Canonical form of a person or place name: all whitespace removed and
/// ASCII parentheses widened to their full-width forms.
pub fn norm_name(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '(' => '（',
            ')' => '）',
            c => c,
        })
        .collect()
}

/// Entities keyed by normalized name, in first-seen order.
///
/// Serializes as a JSON array of the entity objects.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    entities: Vec<Map<String, Value>>,
    by_name: HashMap<String, usize>,
}

impl EntityIndex {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Map<String, Value>> {
        self.by_name
            .get(&norm_name(name))
            .map(|&i| &self.entities[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Map<String, Value>> {
        self.entities.iter()
    }

    /// Insert or fold one entity. Entities with a blank name are dropped.
    pub fn upsert(&mut self, mut obj: Map<String, Value>) {
        let name = norm_name(&text_of(obj.get("name")));
        if name.is_empty() {
            return;
        }

        match self.by_name.get(&name) {
            None => {
                obj.insert("name".to_string(), Value::String(name.clone()));
                if let Some(Value::Array(aliases)) = obj.get_mut("aliases") {
                    *aliases = union_values(&[], aliases, true);
                }
                self.by_name.insert(name, self.entities.len());
                self.entities.push(obj);
            }
            Some(&i) => {
                let current = &mut self.entities[i];
                for field in UNION_FIELDS {
                    let Some(Value::Array(incoming)) = obj.get(field) else {
                        continue;
                    };
                    let existing = match current.get(field) {
                        Some(Value::Array(a)) => a.as_slice(),
                        _ => &[],
                    };
                    let merged = union_values(existing, incoming, field == "aliases");
                    current.insert(field.to_string(), Value::Array(merged));
                }
            }
        }
    }
}

impl Serialize for EntityIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entities.len()))?;
        for e in &self.entities {
            seq.serialize_element(e)?;
        }
        seq.end()
    }
}

/// Set union keeping first-seen order. String values are normalized first
/// when `normalize` is set, and blank strings are dropped in that case.
fn union_values(existing: &[Value], incoming: &[Value], normalize: bool) -> Vec<Value> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(existing.len() + incoming.len());
    for v in existing.iter().chain(incoming) {
        let v = match v {
            Value::String(s) if normalize => {
                let n = norm_name(s);
                if n.is_empty() {
                    continue;
                }
                Value::String(n)
            }
            Value::Null => continue,
            other => other.clone(),
        };
        if seen.insert(v.to_string()) {
            out.push(v);
        }
    }
    out
}

/// Plain text of a scalar field: strings verbatim, missing or null as
/// empty, anything else as its JSON text.
fn text_of(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Merge section outcomes into one volume record.
///
/// Rows with an error contribute nothing to the entity, relation and event
/// lists. Every row given is echoed in `sections`, in order.
pub fn merge_volume(meta: &VolumeMeta, rows: &[SectionOutcome]) -> VolumeRecord {
    let mut people = EntityIndex::default();
    let mut places = EntityIndex::default();
    let mut time_anchors = Vec::new();
    let mut relations = Vec::new();
    let mut events = Vec::new();

    for row in rows.iter().filter(|r| !r.is_error()) {
        let extraction = Extraction::from_value(&row.extraction);
        let Some(fields) = extraction.fields() else {
            tracing::debug!(section = %row.section_id, "non-object extraction ignored in merge");
            continue;
        };

        if let Some(anchors) = &fields.time_anchors {
            time_anchors.extend(anchors.iter().cloned());
        }
        for p in fields.people.iter().flatten() {
            people.upsert(p.clone());
        }
        for p in fields.places.iter().flatten() {
            places.upsert(p.clone());
        }
        relations.extend(fields.relations.iter().flatten().cloned());
        events.extend(fields.events.iter().flatten().cloned());
    }

    VolumeRecord {
        work: meta.work.clone(),
        volume: meta.volume.clone(),
        page_title: meta.page_title.clone(),
        url: meta.url.clone(),
        generated_at: Utc::now(),
        time_anchors,
        people,
        places,
        relations: dedup_relations(relations),
        events: dedup_events(events),
        sections: rows.iter().map(SectionOutcome::section_ref).collect(),
    }
}

fn dedup_relations(relations: Vec<Map<String, Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for mut r in relations {
        let from = norm_name(&text_of(r.get("from")));
        let to = norm_name(&text_of(r.get("to")));
        let key = [
            text_of(r.get("type")),
            from.clone(),
            to.clone(),
            text_of(r.get("relation")),
            text_of(r.get("evidence")),
        ]
        .join("|");
        if !seen.insert(key) {
            continue;
        }
        r.insert("from".to_string(), Value::String(from));
        r.insert("to".to_string(), Value::String(to));
        out.push(Value::Object(r));
    }
    out
}

fn dedup_events(events: Vec<Map<String, Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for mut e in events {
        let first_evidence = match e.get("evidence") {
            Some(Value::Array(ev)) => text_of(ev.first()),
            _ => String::new(),
        };
        let key = [
            text_of(e.get("event_name")),
            text_of(e.get("time")),
            text_of(e.get("place")),
            first_evidence,
        ]
        .join("|");
        if !seen.insert(key) {
            continue;
        }
        if let Some(Value::Array(participants)) = e.get_mut("participants") {
            *participants = participants
                .iter()
                .map(|p| norm_name(&text_of(Some(p))))
                .filter(|p| !p.is_empty())
                .map(Value::String)
                .collect();
        }
        out.push(Value::Object(e));
    }
    out
}
