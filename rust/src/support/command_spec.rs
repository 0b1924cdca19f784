use std::collections::BTreeMap;
use std::path::PathBuf;

/// A fully resolved child invocation: program plus discrete argument tokens.
///
/// Arguments are handed to the OS as a vector. `command_line` exists only for
/// the audit header and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn current_dir(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering for humans.
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_tokens_with_metacharacters() {
        let spec = CommandSpec::new("/opt/do_bamcheck.sh")
            .arg("9:100;9:200@a|b")
            .arg("plain");
        assert_eq!(
            spec.command_line(),
            "/opt/do_bamcheck.sh '9:100;9:200@a|b' plain"
        );
        assert_eq!(spec.argv().len(), 3);
    }

    #[test]
    fn builder_keeps_argument_order() {
        let spec = CommandSpec::new("sbatch")
            .args(["--parsable", "--ntasks=1"])
            .arg("/opt/job.sh");
        assert_eq!(spec.args, vec!["--parsable", "--ntasks=1", "/opt/job.sh"]);
    }
}
