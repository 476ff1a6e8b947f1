use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use timesift_core::labels::TAG_FIELD;

use crate::analyzer::{Analyzer, AnalyzerArgs, AnalyzerContext, AnalyzerDescriptor, AnalyzerKwargs, EventQuery};
use crate::error::EngineError;

pub const NAME: &str = "tagger";

/// One tagging rule, carried as the keyword arguments of an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggerRule {
    pub name: String,
    pub query: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub star: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl TaggerRule {
    pub fn from_args(args: &AnalyzerArgs) -> Result<Self, EngineError> {
        let rule: Self = serde_json::from_value(Value::Object(args.clone()))
            .map_err(|e| EngineError::Validation(format!("invalid tagger rule: {e}")))?;
        if rule.name.is_empty() || rule.query.is_empty() {
            return Err(EngineError::Validation("tagger rule needs a name and a query".into()));
        }
        if rule.tags.iter().all(|t| t.is_empty()) {
            return Err(EngineError::Validation(format!("tagger rule {} has no tags", rule.name)));
        }
        Ok(rule)
    }
}

fn rule_args(rule: Value) -> AnalyzerArgs {
    match rule {
        Value::Object(args) => args,
        _ => AnalyzerArgs::new(),
    }
}

/// Rules shipped with the analyzer, one instance each.
pub fn builtin_rules() -> Vec<AnalyzerArgs> {
    vec![
        rule_args(json!({
            "name": "failed_logins",
            "query": "event_identifier:4625",
            "tags": ["failed-login"],
        })),
        rule_args(json!({
            "name": "encoded_powershell",
            "query": "powershell AND encodedcommand",
            "tags": ["powershell", "encoded-command"],
            "star": true,
            "comment": "Encoded PowerShell command line",
        })),
        rule_args(json!({
            "name": "ssh_logins",
            "query": "reporter:sshd AND accepted",
            "tags": ["ssh-login"],
        })),
    ]
}

pub fn descriptor() -> AnalyzerDescriptor {
    AnalyzerDescriptor::new(NAME, "Tagger").with_kwargs(AnalyzerKwargs::Multiple(builtin_rules()))
}

/// Tags every event matching its rule's query.
pub struct TaggerAnalyzer {
    rule: TaggerRule,
}

impl TaggerAnalyzer {
    pub fn new(rule: TaggerRule) -> Self {
        Self { rule }
    }

    pub fn from_args(args: &AnalyzerArgs) -> Result<Self, EngineError> {
        Ok(Self::new(TaggerRule::from_args(args)?))
    }

    pub fn rule(&self) -> &TaggerRule {
        &self.rule
    }
}

#[async_trait]
impl Analyzer for TaggerAnalyzer {
    async fn run(&self, ctx: &AnalyzerContext) -> Result<String, EngineError> {
        let query = EventQuery::new(self.rule.query.as_str()).return_fields([TAG_FIELD]);
        let mut events = ctx.event_stream(query).await?;

        let mut tagged = 0usize;
        while let Some(event) = events.next().await {
            let mut event = event?;
            event.add_tags(self.rule.tags.as_slice()).await?;
            if self.rule.star {
                event.add_star().await?;
            }
            if let Some(comment) = &self.rule.comment {
                event.add_comment(comment).await?;
            }
            tagged += 1;
        }

        info!(rule = %self.rule.name, tagged, "tagging rule applied");
        Ok(format!("{tagged} events tagged by {}", self.rule.name))
    }
}
