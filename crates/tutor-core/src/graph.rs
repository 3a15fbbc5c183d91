//! Curriculum knowledge-graph extraction from textbook sources.
//!
//! Each source is sent to the generation collaborator once with a structured
//! schema. Replies are untrusted: they are decoded, normalised and merged here,
//! and nothing reaches the caller unless it decodes as a graph.

use std::collections::HashSet;
use std::slice;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::context::{DEFAULT_MAX_GROUNDING_CHARS, TextbookSource, assemble_grounding};
use crate::error::{FailureKind, GenerationFailure, PreconditionFailure, TutorError};
use crate::invoker::{GenerationRequest, Generator, OutputMode, PromptPart};
use crate::prompts::GRAPH_EXTRACTION_INSTRUCTIONS;
use crate::roles::AgentRole;
use crate::stages::strip_code_fence;

/// Relation labels a graph may carry.
pub const PEDAGOGICAL_RELATIONS: [&str; 5] = [
    "PREREQUISITE_FOR",
    "PART_OF",
    "RELATES_TO",
    "PRODUCES",
    "CAUSES",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub relation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl KnowledgeGraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Fold `other` into `self`. Entities are keyed by name and the later type
    /// wins; identical relationships are kept once.
    pub fn merge(&mut self, other: KnowledgeGraph) {
        for entity in other.entities {
            match self.entities.iter_mut().find(|e| e.name == entity.name) {
                Some(existing) => existing.kind = entity.kind,
                None => self.entities.push(entity),
            }
        }
        let mut seen: HashSet<Relationship> = self.relationships.iter().cloned().collect();
        for relationship in other.relationships {
            if seen.insert(relationship.clone()) {
                self.relationships.push(relationship);
            }
        }
    }

    fn has_entity(&self, name: &str) -> bool {
        self.entities.iter().any(|e| e.name == name)
    }
}

pub fn graph_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "entities": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING" },
                        "type": { "type": "STRING" }
                    },
                    "required": ["name", "type"]
                }
            },
            "relationships": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "source": { "type": "STRING" },
                        "target": { "type": "STRING" },
                        "relation": { "type": "STRING", "enum": PEDAGOGICAL_RELATIONS }
                    },
                    "required": ["source", "target", "relation"]
                }
            }
        },
        "required": ["entities", "relationships"]
    })
}

/// Decode one collaborator reply.
///
/// Blank names, unknown relations and relationships whose endpoints are not
/// listed entities are dropped. A reply that is not a graph object at all is a
/// `Malformed` failure.
pub fn decode_graph(raw: &str) -> Result<KnowledgeGraph, GenerationFailure> {
    let parsed: KnowledgeGraph = serde_json::from_str(strip_code_fence(raw)).map_err(|err| {
        GenerationFailure::new(
            FailureKind::Malformed,
            format!("knowledge graph did not decode: {err}"),
        )
    })?;

    let mut graph = KnowledgeGraph::default();
    graph.merge(KnowledgeGraph {
        entities: parsed
            .entities
            .into_iter()
            .filter_map(|entity| {
                let name = entity.name.trim();
                (!name.is_empty()).then(|| Entity {
                    name: name.to_string(),
                    kind: entity.kind.trim().to_string(),
                })
            })
            .collect(),
        relationships: Vec::new(),
    });

    let mut kept = Vec::new();
    for relationship in parsed.relationships {
        let Some(relation) = normalize_relation(&relationship.relation) else {
            warn!(relation = %relationship.relation, "dropping relationship with unknown relation");
            continue;
        };
        let source = relationship.source.trim().to_string();
        let target = relationship.target.trim().to_string();
        if !graph.has_entity(&source) || !graph.has_entity(&target) {
            warn!(%source, %target, "dropping relationship with unlisted endpoint");
            continue;
        }
        kept.push(Relationship {
            source,
            target,
            relation,
        });
    }
    graph.merge(KnowledgeGraph {
        entities: Vec::new(),
        relationships: kept,
    });
    Ok(graph)
}

/// `"prerequisite for"` and `"Prerequisite-For"` both map to `PREREQUISITE_FOR`.
fn normalize_relation(raw: &str) -> Option<String> {
    let relation = raw.trim().to_ascii_uppercase().replace([' ', '-'], "_");
    PEDAGOGICAL_RELATIONS
        .contains(&relation.as_str())
        .then_some(relation)
}

/// Runs graph extraction over a set of textbook sources.
#[derive(Clone)]
pub struct GraphExtractor {
    generator: Arc<dyn Generator>,
    max_chars: usize,
}

impl GraphExtractor {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            max_chars: DEFAULT_MAX_GROUNDING_CHARS,
        }
    }

    /// Per-source character cap on the section text sent to the collaborator.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Extract one graph per source and merge them in source order.
    #[instrument(skip_all, fields(sources = sources.len(), model = %self.generator.model_id()))]
    pub async fn extract(&self, sources: &[TextbookSource]) -> Result<KnowledgeGraph, TutorError> {
        if sources.is_empty() {
            return Err(PreconditionFailure::NoTextbookSource.into());
        }

        let mut graph = KnowledgeGraph::default();
        for source in sources {
            let section = assemble_grounding(slice::from_ref(source), self.max_chars);
            let request = GenerationRequest {
                role: AgentRole::Librarian,
                instructions: GRAPH_EXTRACTION_INSTRUCTIONS.to_string(),
                parts: vec![PromptPart::text(format!(
                    "Extract the graph from this textbook section:\n\n{}",
                    section.text
                ))],
                output: OutputMode::Structured(graph_schema()),
            };
            let raw = self
                .generator
                .generate(request)
                .await
                .map_err(|failure| TutorError::generation(AgentRole::Librarian, failure))?;
            let extracted = decode_graph(&raw)
                .map_err(|failure| TutorError::generation(AgentRole::Librarian, failure))?;
            info!(
                source = %source.source_label,
                entities = extracted.entities.len(),
                relationships = extracted.relationships.len(),
                "extracted knowledge graph section"
            );
            graph.merge(extracted);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, GenerationFailure>>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, GenerationFailure>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationFailure> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    const FORCES: &str = r#"{
        "entities": [
            {"name": "Force", "type": "Concept"},
            {"name": "Newton's second law", "type": "Law"},
            {"name": "Acceleration", "type": "Concept"}
        ],
        "relationships": [
            {"source": "Force", "target": "Newton's second law", "relation": "PREREQUISITE_FOR"},
            {"source": "Acceleration", "target": "Newton's second law", "relation": "part of"},
            {"source": "Force", "target": "Momentum", "relation": "RELATES_TO"},
            {"source": "Force", "target": "Acceleration", "relation": "INSPIRES"}
        ]
    }"#;

    #[test]
    fn decode_keeps_only_linked_pedagogical_relations() {
        let graph = decode_graph(FORCES).unwrap();
        assert_eq!(graph.entities.len(), 3);
        assert_eq!(
            graph.relationships,
            vec![
                Relationship {
                    source: "Force".into(),
                    target: "Newton's second law".into(),
                    relation: "PREREQUISITE_FOR".into(),
                },
                Relationship {
                    source: "Acceleration".into(),
                    target: "Newton's second law".into(),
                    relation: "PART_OF".into(),
                },
            ]
        );
    }

    #[test]
    fn decode_accepts_fenced_json_and_rejects_prose() {
        let fenced = "```json\n{\"entities\":[{\"name\":\"Cell\",\"type\":\"Structure\"}],\"relationships\":[]}\n```";
        assert_eq!(decode_graph(fenced).unwrap().entities[0].name, "Cell");

        let err = decode_graph("Here is your graph: Cell -> Mitochondria").unwrap_err();
        assert_eq!(err.kind, FailureKind::Malformed);
    }

    #[test]
    fn merge_keys_entities_by_name() {
        let mut graph = decode_graph(FORCES).unwrap();
        let repeated = graph.relationships.clone();
        graph.merge(KnowledgeGraph {
            entities: vec![
                Entity {
                    name: "Force".into(),
                    kind: "Vector quantity".into(),
                },
                Entity {
                    name: "Momentum".into(),
                    kind: "Concept".into(),
                },
            ],
            relationships: repeated,
        });
        assert_eq!(graph.entities.len(), 4);
        assert_eq!(graph.entities[0].kind, "Vector quantity");
        assert_eq!(graph.relationships.len(), 2);
    }

    #[test]
    fn schema_serialises_entity_type_field() {
        let schema = graph_schema();
        assert!(schema["properties"]["entities"]["items"]["properties"]["type"].is_object());
        assert_eq!(
            schema["properties"]["relationships"]["items"]["properties"]["relation"]["enum"]
                .as_array()
                .map(Vec::len),
            Some(PEDAGOGICAL_RELATIONS.len())
        );
        let entity = serde_json::to_value(Entity {
            name: "Cell".into(),
            kind: "Structure".into(),
        })
        .unwrap();
        assert_eq!(entity["type"], "Structure");
    }

    #[tokio::test]
    async fn extract_calls_once_per_source_with_schema() {
        let generator = Scripted::new(vec![
            Ok(FORCES.to_string()),
            Ok(r#"{"entities":[{"name":"Momentum","type":"Concept"},{"name":"Force","type":"Concept"}],
                  "relationships":[{"source":"Force","target":"Momentum","relation":"CAUSES"}]}"#
                .to_string()),
        ]);
        let extractor = GraphExtractor::new(generator.clone());
        let sources = vec![
            TextbookSource::new("Ch3", "F = ma"),
            TextbookSource::new("Ch4", "p = mv"),
        ];

        let graph = extractor.extract(&sources).await.unwrap();
        assert_eq!(graph.entities.len(), 4);
        assert_eq!(graph.relationships.len(), 3);

        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].text().contains("--- SOURCE: Ch3 ---\nF = ma"));
        assert!(requests[1].text().contains("--- SOURCE: Ch4 ---"));
        assert!(requests.iter().all(|r| r.output == OutputMode::Structured(graph_schema())));
        assert!(requests[0].instructions.contains("GCSE Curriculum Librarian"));
    }

    #[tokio::test]
    async fn extract_requires_a_source() {
        let generator = Scripted::new(Vec::new());
        let err = GraphExtractor::new(generator.clone())
            .extract(&[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TutorError::Precondition(PreconditionFailure::NoTextbookSource)
        ));
        assert!(generator.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_reply_fails_as_librarian() {
        let generator = Scripted::new(vec![Ok("I could not find any concepts.".into())]);
        let err = GraphExtractor::new(generator)
            .with_max_chars(4)
            .extract(&[TextbookSource::new("Ch1", "cells")])
            .await
            .unwrap_err();
        match err {
            TutorError::Generation { stage, source } => {
                assert_eq!(stage, AgentRole::Librarian);
                assert_eq!(source.kind, FailureKind::Malformed);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
