use serde::{ Serialize, Deserialize };

/// Progress of a turn that runs web search augmentation first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    Searching {
        query: String,
    },
    SearchComplete {
        results: usize,
    },
    SearchError {
        message: String,
    },
    Generating,
}

/// Control frames the socket transport sends next to the relayed chunks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "status")] Status(TurnStatus),
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "done")] Done {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        conversation_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode frame: {}"}}"#, e)
        })
    }
}
