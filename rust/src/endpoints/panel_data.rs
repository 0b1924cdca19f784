use crate::config::ScriptSettings;
use crate::error::ProxyError;
use crate::support::command_spec::CommandSpec;
use crate::validate::{self, FieldMap};

pub const NAME: &str = "panel_data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelDataRequest {
    pub sequencer: String,
    pub run: String,
    pub library: String,
    pub project: String,
    pub sample: String,
}

impl PanelDataRequest {
    pub fn from_fields(fields: &FieldMap) -> Result<Self, ProxyError> {
        Ok(Self {
            sequencer: validate::identifier(
                "sequencer",
                validate::required(fields, "sequencer")?,
            )?,
            run: validate::run_path("run", validate::required(fields, "run")?)?,
            library: validate::identifier("library", validate::required(fields, "library")?)?,
            project: validate::identifier("project", validate::required(fields, "project")?)?,
            sample: validate::identifier("sample", validate::required(fields, "sample")?)?,
        })
    }

    pub fn command(&self, scripts: &ScriptSettings) -> CommandSpec {
        CommandSpec::new(&scripts.panel_data).args([
            "-S",
            self.sequencer.as_str(),
            "-p",
            self.run.as_str(),
            "-l",
            self.library.as_str(),
            "-P",
            self.project.as_str(),
            "-L",
            self.sample.as_str(),
        ])
    }
}
