use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExecId(Uuid);

impl ExecId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u32);

impl Display for TabId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Text(String),
    Bool(bool),
    Number(f64),
    Error(String),
    Structured(Value),
}

impl Response {
    pub fn summary(&self) -> String {
        match self {
            Self::Text(text) | Self::Error(text) => text.clone(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ResponseKind {
    Scalar,
    Table,
    Structured,
}

impl ResponseKind {
    pub fn classify(response: &Response) -> Self {
        match response {
            Response::Structured(Value::Array(items))
                if !items.is_empty() && items.iter().all(Value::is_object) =>
            {
                Self::Table
            }
            Response::Structured(_) => Self::Structured,
            _ => Self::Scalar,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Table => "table",
            Self::Structured => "structured",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecOptions {
    pub echo: bool,
    /// Forces (`Some(true)`) or forbids (`Some(false)`) inline rendering of
    /// the response in the block list.
    pub render: Option<bool>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            echo: true,
            render: None,
        }
    }
}

impl ExecOptions {
    pub fn quiet() -> Self {
        Self {
            echo: false,
            render: None,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOptions {
    pub always_view_in_sidecar: bool,
}

/// Decides whether a completed response is stored inline in its block or
/// replaced by a plain "ok" marker and viewed elsewhere.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InlinePolicy {
    pub inline_scalar_responses: bool,
}

impl Default for InlinePolicy {
    fn default() -> Self {
        Self {
            inline_scalar_responses: true,
        }
    }
}

impl InlinePolicy {
    pub fn shows_inline(
        &self,
        kind: ResponseKind,
        evaluator: &EvaluatorOptions,
        exec: &ExecOptions,
    ) -> bool {
        if kind != ResponseKind::Scalar {
            return false;
        }
        if let Some(render) = exec.render {
            return render;
        }
        if evaluator.always_view_in_sidecar {
            return false;
        }
        self.inline_scalar_responses
    }
}

#[cfg(test)]
mod tests {
    use super::{
        EvaluatorOptions, ExecId, ExecOptions, InlinePolicy, Response, ResponseKind, TabId,
    };
    use serde_json::json;

    #[test]
    fn exec_ids_are_never_reused() {
        let ids = (0..64).map(|_| ExecId::new()).collect::<Vec<_>>();
        for (idx, id) in ids.iter().enumerate() {
            assert!(!ids[idx + 1..].contains(id));
        }
    }

    #[test]
    fn classify_marks_object_arrays_as_tables() {
        let rows = Response::Structured(json!([{ "name": "a" }, { "name": "b" }]));
        assert_eq!(ResponseKind::classify(&rows), ResponseKind::Table);
        let object = Response::Structured(json!({ "kind": "Pod" }));
        assert_eq!(ResponseKind::classify(&object), ResponseKind::Structured);
        let text = Response::Text("hello".to_string());
        assert_eq!(ResponseKind::classify(&text), ResponseKind::Scalar);
        let empty = Response::Structured(json!([]));
        assert_eq!(ResponseKind::classify(&empty), ResponseKind::Structured);
    }

    #[test]
    fn inline_policy_only_admits_scalars() {
        let policy = InlinePolicy::default();
        let evaluator = EvaluatorOptions::default();
        let exec = ExecOptions::default();
        assert!(policy.shows_inline(ResponseKind::Scalar, &evaluator, &exec));
        assert!(!policy.shows_inline(ResponseKind::Table, &evaluator, &exec));

        let forced = ExecOptions {
            render: Some(true),
            ..ExecOptions::default()
        };
        assert!(!policy.shows_inline(ResponseKind::Structured, &evaluator, &forced));
    }

    #[test]
    fn inline_policy_respects_overrides_and_flag() {
        let flag_off = InlinePolicy {
            inline_scalar_responses: false,
        };
        let evaluator = EvaluatorOptions::default();
        assert!(!flag_off.shows_inline(ResponseKind::Scalar, &evaluator, &ExecOptions::default()));

        let forced = ExecOptions {
            render: Some(true),
            ..ExecOptions::default()
        };
        assert!(flag_off.shows_inline(ResponseKind::Scalar, &evaluator, &forced));

        let sidecar = EvaluatorOptions {
            always_view_in_sidecar: true,
        };
        assert!(
            !InlinePolicy::default().shows_inline(
                ResponseKind::Scalar,
                &sidecar,
                &ExecOptions::default()
            )
        );
    }

    #[test]
    fn tab_id_displays_as_bare_number() {
        assert_eq!(TabId(7).to_string(), "7");
    }
}
