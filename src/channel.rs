//! Method-call boundary.
//!
//! Host applications talk to the vault with named method calls carrying a
//! JSON argument map, in the shape a platform channel delivers them:
//!
//! | method        | arguments                                   | reply          |
//! |---------------|---------------------------------------------|----------------|
//! | `existsKey`   | `key`, `prefix?`                            | bool           |
//! | `getValue`    | `key`, `prefix?`                            | string or null |
//! | `setValue`    | `key`, `value`, `prefix?`, `persist?`, `useTPM?` | none      |
//! | `deleteValue` | `key`, `prefix?`                            | none           |
//! | `deleteAll`   | `prefix?`                                   | none           |
//!
//! Optional arguments of the wrong type are ignored and their defaults apply.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::engine::{VaultEngine, WriteOptions};
use crate::error::{Result, VaultError};
use crate::secret::Persistence;
use crate::store::PlatformSecretStore;
use crate::tpm::TpmKeyProvider;

/// A named request with its raw arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Successful result of a method call.
#[derive(Debug)]
pub enum Reply {
    Bool(bool),
    /// A stored value, or `None` when nothing readable is stored.
    Value(Option<SecretString>),
    /// The operation completed and returns nothing.
    Done,
}

impl Reply {
    /// Renders the reply for the wire. This exposes the secret.
    pub fn to_json(&self) -> Value {
        match self {
            Reply::Bool(b) => Value::Bool(*b),
            Reply::Value(Some(secret)) => Value::String(secret.expose_secret().to_owned()),
            Reply::Value(None) | Reply::Done => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    ExistsKey,
    GetValue,
    SetValue,
    DeleteValue,
    DeleteAll,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "existsKey" => Some(Method::ExistsKey),
            "getValue" => Some(Method::GetValue),
            "setValue" => Some(Method::SetValue),
            "deleteValue" => Some(Method::DeleteValue),
            "deleteAll" => Some(Method::DeleteAll),
            _ => None,
        }
    }
}

/// Arguments shared by every method.
struct CommonArgs<'a> {
    prefix: Option<&'a str>,
    options: WriteOptions,
}

impl<'a> CommonArgs<'a> {
    fn parse(args: &'a Map<String, Value>) -> Self {
        let prefix = args.get("prefix").and_then(Value::as_str);
        let mut options = WriteOptions::default();
        if let Some(persist) = args.get("persist").and_then(Value::as_str) {
            options.persistence = Persistence::from_name(persist);
        }
        if let Some(use_tpm) = args.get("useTPM").and_then(Value::as_bool) {
            options.prefer_tpm = use_tpm;
        }
        Self { prefix, options }
    }
}

fn required_key(args: &Map<String, Value>) -> Result<&str> {
    match args.get("key") {
        None => Err(VaultError::InvalidArgument("Key is required".into())),
        Some(value) => value
            .as_str()
            .ok_or_else(|| VaultError::InvalidArgument("Key must be a string".into())),
    }
}

fn required_key_and_value(args: &Map<String, Value>) -> Result<(&str, &str)> {
    match (args.get("key"), args.get("value")) {
        (Some(key), Some(value)) => match (key.as_str(), value.as_str()) {
            (Some(key), Some(value)) => Ok((key, value)),
            _ => Err(VaultError::InvalidArgument(
                "Key and value must be strings".into(),
            )),
        },
        _ => Err(VaultError::InvalidArgument(
            "Key and value are required".into(),
        )),
    }
}

/// Dispatches `call` against `engine`.
#[instrument(level = "debug", skip(engine, call), fields(method = %call.method))]
pub fn handle<S, T>(engine: &VaultEngine<S, T>, call: &MethodCall) -> Result<Reply>
where
    S: PlatformSecretStore,
    T: TpmKeyProvider,
{
    let Some(args) = call.arguments.as_object() else {
        return Err(VaultError::InvalidArgument(
            "Arguments must be a map".into(),
        ));
    };
    let common = CommonArgs::parse(args);

    let Some(method) = Method::from_name(&call.method) else {
        debug!("Unknown method");
        return Err(VaultError::NotImplemented(call.method.clone()));
    };

    match method {
        Method::ExistsKey => {
            let key = required_key(args)?;
            Ok(Reply::Bool(engine.exists(key, common.prefix)))
        }
        Method::GetValue => {
            let key = required_key(args)?;
            Ok(Reply::Value(engine.get(key, common.prefix)))
        }
        Method::SetValue => {
            let (key, value) = required_key_and_value(args)?;
            engine.set(key, value, common.prefix, common.options)?;
            Ok(Reply::Done)
        }
        Method::DeleteValue => {
            let key = required_key(args)?;
            engine.delete(key, common.prefix)?;
            Ok(Reply::Done)
        }
        Method::DeleteAll => {
            engine.delete_all(common.prefix)?;
            Ok(Reply::Done)
        }
    }
}
