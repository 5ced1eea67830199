use chrono::Utc;
use serde_json::json;

use super::JobId;

/// Tag carried by every generated record
pub const PAYLOAD_SOURCE: &str = "kafka-tool-simulator";

/// Key and JSON value for the `number`-th automatic record of `job`
pub(crate) fn generate(job: JobId, number: u64) -> (String, String) {
    let value = json!({
        "id": format!("{}-{:08}", job, number),
        "timestamp": Utc::now().to_rfc3339(),
        "message_number": number,
        "data": format!("Auto-generated message #{}", number),
        "source": PAYLOAD_SOURCE,
    });
    (format!("auto-{}", number), value.to_string())
}
