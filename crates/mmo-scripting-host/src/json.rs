use rquickjs::function::This;
use rquickjs::{Ctx, Value};

use crate::error::ScriptError;

/// Failure while looking up or running the engine's JSON parser
pub enum JsonFailure {
    /// `JSON.parse` is not reachable from the script-visible namespace
    MissingParser,
    /// The parser failed; an exception may be pending on the context
    Threw(rquickjs::Error),
}

/// Parse `text` with the `JSON.parse` found in the script-visible namespace
pub fn parse<'js>(ctx: &Ctx<'js>, text: &str) -> Result<Value<'js>, JsonFailure> {
    let json: Value = ctx
        .globals()
        .get("JSON")
        .map_err(|_| JsonFailure::MissingParser)?;
    let Some(json) = json.into_object() else {
        return Err(JsonFailure::MissingParser);
    };
    let parse = json
        .get::<_, Value>("parse")
        .ok()
        .and_then(Value::into_function)
        .ok_or(JsonFailure::MissingParser)?;

    parse
        .call((This(json), text))
        .map_err(JsonFailure::Threw)
}

pub fn missing_parser_error() -> ScriptError {
    ScriptError::integration("JSON parser is not available in the script namespace")
}
