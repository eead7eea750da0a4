//! The smallest useful server: a greeting, a calculator, and a counter that streams progress.
use mcpline_server::{
    ManifestError, McpServer, ParamType, ServerConfig, Tool, ToolCall, ToolError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const NAME: &str = "minimal";

/// Largest value `count` will count to
const MAX_COUNT: u32 = 100;

pub fn server(config: ServerConfig) -> Result<McpServer, ManifestError> {
    McpServer::builder(NAME, "A minimal example server with greeting and arithmetic tools")
        .config(config)
        .tool(
            Tool::new("greet", "Greet someone by name").required(
                "name",
                ParamType::String,
                "The name of the person to greet",
            ),
            greet,
        )
        .tool(
            Tool::new("calculate", "Perform a basic arithmetic operation on two numbers")
                .required("a", ParamType::Number, "First number")
                .required("b", ParamType::Number, "Second number")
                .required("operation", ParamType::String, "Operation to perform")
                .one_of("operation", Operation::NAMES),
            calculate,
        )
        .tool(
            Tool::new(
                "count",
                "Count from 1 up to a number, reporting each step as a partial result",
            )
            .required(
                "to",
                ParamType::Integer,
                "Number to count up to (1 to 100)",
            )
            .optional(
                "delay_ms",
                ParamType::Integer,
                "Milliseconds to wait between steps",
            ),
            count,
        )
        .build()
}

async fn greet(call: ToolCall) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        name: String,
    }

    let Args { name } = call.args()?;
    Ok(json!({ "message": format!("Hello, {name}!") }))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    const NAMES: [&'static str; 4] = ["add", "subtract", "multiply", "divide"];

    fn parse(name: &str) -> Result<Self, ToolError> {
        match name {
            "add" => Ok(Operation::Add),
            "subtract" => Ok(Operation::Subtract),
            "multiply" => Ok(Operation::Multiply),
            "divide" => Ok(Operation::Divide),
            other => Err(ToolError::failed(format!("Unknown operation: {other}"))),
        }
    }

    fn apply(self, a: f64, b: f64) -> Result<f64, ToolError> {
        let result = match self {
            Operation::Add => a + b,
            Operation::Subtract => a - b,
            Operation::Multiply => a * b,
            Operation::Divide if b == 0.0 => {
                return Err(ToolError::failed("Cannot divide by zero"))
            }
            Operation::Divide => a / b,
        };

        if result.is_finite() {
            Ok(result)
        } else {
            Err(ToolError::failed("Result is out of range"))
        }
    }
}

async fn calculate(call: ToolCall) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        a: f64,
        b: f64,
        operation: String,
    }

    let Args { a, b, operation } = call.args()?;
    let result = Operation::parse(&operation)?.apply(a, b)?;

    Ok(json!({ "result": number(result) }))
}

/// Whole numbers go out as JSON integers, so `4 / 2` answers `2` rather than `2.0`
fn number(value: f64) -> Value {
    // Beyond 2^53 not every integer is representable, so there is nothing to gain
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

    if value.fract() == 0.0 && value.abs() <= MAX_EXACT {
        json!(value as i64)
    } else {
        json!(value)
    }
}

async fn count(call: ToolCall) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        to: u32,
        #[serde(default)]
        delay_ms: u64,
    }

    let Args { to, delay_ms } = call.args()?;
    if !(1..=MAX_COUNT).contains(&to) {
        return Err(ToolError::invalid_arguments(format!(
            "`to` must be between 1 and {MAX_COUNT}"
        )));
    }

    for i in 1..to {
        call.report_progress(&json!({ "count": i })).await;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    Ok(json!({ "count": to, "done": true }))
}
