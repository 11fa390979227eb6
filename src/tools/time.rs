//! get_time 工具：返回当前时间（可指定 UTC 偏移小时数）

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::parameters_schema;
use crate::tools::{Tool, ToolContext};

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct GetTimeArgs {
    /// 相对 UTC 的小时偏移，例如 8 表示 UTC+8；缺省为 0
    utc_offset_hours: Option<i32>,
}

pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally shifted to a UTC offset in hours."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<GetTimeArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let hours = match args.get("utc_offset_hours") {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n.as_i64().ok_or("utc_offset_hours must be an integer")?,
            Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| format!("invalid utc_offset_hours: {}", s))?,
            Some(other) => return Err(format!("invalid utc_offset_hours: {}", other)),
        };
        if !(-12..=14).contains(&hours) {
            return Err(format!("utc_offset_hours out of range: {}", hours));
        }
        let offset = FixedOffset::east_opt(hours as i32 * 3600).ok_or("invalid offset")?;
        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "datetime": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_time_offset() {
        let out = GetTimeTool
            .execute(json!({"utc_offset_hours": 8}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out["datetime"].as_str().unwrap().ends_with("+08:00"));
        assert!(out["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_get_time_rejects_bad_offset() {
        let err = GetTimeTool
            .execute(json!({"utc_offset_hours": 40}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.contains("out of range"));
    }
}
