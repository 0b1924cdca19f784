use crate::config::ScriptSettings;
use crate::error::ProxyError;
use crate::support::command_spec::CommandSpec;
use crate::validate::{self, FieldMap};

pub const NAME: &str = "bamcheck";

/// `filename` is `<positions>@<samples>` as produced by the desktop client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BamcheckRequest {
    pub filename: String,
    pub patients: String,
    pub positions: String,
}

impl BamcheckRequest {
    pub fn from_fields(fields: &FieldMap) -> Result<Self, ProxyError> {
        Ok(Self {
            filename: validate::file_name("filename", validate::required(fields, "filename")?)?,
            patients: validate::sample_list("patients", validate::required(fields, "patients")?)?,
            positions: validate::position_list(
                "positions",
                validate::required(fields, "positions")?,
            )?,
        })
    }

    pub fn command(&self, scripts: &ScriptSettings) -> CommandSpec {
        CommandSpec::new(&scripts.bamcheck).args([&self.filename, &self.patients, &self.positions])
    }
}
