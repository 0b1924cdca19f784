use std::path::Path;

use chrono::{DateTime, Local};

use crate::config::{SchedulerSettings, ScriptSettings};
use crate::error::ProxyError;
use crate::support::command_spec::CommandSpec;
use crate::validate::{self, FieldMap};

pub const NAME: &str = "coverage_matrix";
pub const UPLOAD_FIELD: &str = "bed";

const MAX_MAPQV: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageMatrixRequest {
    pub patients: String,
    pub analysis: String,
    pub mapqv: u32,
    pub output: String,
}

impl CoverageMatrixRequest {
    pub fn from_fields(fields: &FieldMap) -> Result<Self, ProxyError> {
        Ok(Self {
            patients: validate::sample_list("patients", validate::required(fields, "patients")?)?,
            analysis: validate::identifier("analysis", validate::required(fields, "analysis")?)?,
            mapqv: validate::count("mapqv", validate::required(fields, "mapqv")?, MAX_MAPQV)?,
            output: validate::file_name("output", validate::required(fields, "output")?)?,
        })
    }

    /// Builds the `sbatch` submission. The job itself reads its inputs from
    /// the exported variables, so the staged upload must outlive the request.
    pub fn command(
        &self,
        scheduler: &SchedulerSettings,
        scripts: &ScriptSettings,
        staged_bed: &Path,
        now: DateTime<Local>,
    ) -> Result<CommandSpec, ProxyError> {
        let bed = staged_bed.to_str().ok_or_else(|| {
            ProxyError::UploadFailed(format!(
                "staged path {} is not valid UTF-8",
                staged_bed.display()
            ))
        })?;
        if bed.contains(',') {
            return Err(ProxyError::UploadFailed(format!(
                "staged path {bed} contains ',' and cannot be exported"
            )));
        }

        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", job_name(&scheduler.job_prefix, now)),
            format!("--partition={}", scheduler.partition),
            format!("--chdir={}", scheduler.chdir.display()),
        ];
        if let Some(mail_user) = scheduler.mail_user.as_deref() {
            args.push(format!("--mail-user={mail_user}"));
        }
        args.extend([
            format!("--mail-type={}", scheduler.mail_type),
            format!("--ntasks={}", scheduler.ntasks),
            format!("--cpus-per-task={}", scheduler.cpus_per_task),
            format!("--mem={}", scheduler.mem),
            format!("--time={}", scheduler.time),
            format!("--output={}", scheduler.log_dir.join("%j.%x").display()),
            format!(
                "--export=ALL,bed={bed},patients={},analysis={},mapqv={},outputfile={}",
                self.patients, self.analysis, self.mapqv, self.output
            ),
            scripts.coverage_matrix.clone(),
        ]);

        Ok(CommandSpec::new(&scheduler.program).args(args))
    }
}

fn job_name(prefix: &str, now: DateTime<Local>) -> String {
    format!("{prefix}.{}", now.format("%Y-%m-%d.%H-%M"))
}
