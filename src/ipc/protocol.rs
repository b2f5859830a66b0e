//! Line-framed JSON protocol (§4.9): one `Command` in, one `Envelope` out,
//! per connection.

use crate::config::PrinterConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum Command {
    GetStatus { name: String },
    ListPrinters,
    GetPrinterDetails { name: String },
    GetPrinterConfig { name: String },
    AddPrinter { config: PrinterConfig },
    DeletePrinter { name: String },
    ModifyPrinter { name: String, config: PrinterConfig },
    PausePrinter { name: String },
    ResumePrinter { name: String },
    SetLed { name: String, on: bool, brightness: u8 },
    ChangeInterfaces { interfaces: Vec<String> },
    ReloadConfig,
    StopService,
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
