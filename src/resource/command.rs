//! Typed payload invocation.

use std::fmt;
use std::path::Path;

/// One whitespace-separated token of the payload invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// `flag=value`, split on the first `=`.
    Option { flag: String, value: String },
    /// Anything else, kept verbatim.
    Word(String),
}

impl Arg {
    fn parse(token: &str) -> Self {
        match token.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => Arg::Option {
                flag: flag.to_string(),
                value: value.to_string(),
            },
            _ => Arg::Word(token.to_string()),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Option { flag, value } => write!(f, "{flag}={value}"),
            Arg::Word(word) => f.write_str(word),
        }
    }
}

/// The payload invocation as an argument list: the executable first, its
/// parameters after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCommand {
    args: Vec<Arg>,
}

impl PayloadCommand {
    /// Tokenize `transformation jobparams` on whitespace.
    pub fn parse(transformation: &str, jobparams: &str) -> Self {
        let args = transformation
            .split_whitespace()
            .chain(jobparams.split_whitespace())
            .map(Arg::parse)
            .collect();
        Self { args }
    }

    #[cfg(test)]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Point the file named by each of `flags` at `scratch_dir`. The
    /// executable itself is never rewritten.
    pub fn relocate_inputs(mut self, flags: &[String], scratch_dir: &Path) -> Self {
        for arg in self.args.iter_mut().skip(1) {
            if let Arg::Option { flag, value } = arg {
                if flags.iter().any(|f| f == flag) && !value.is_empty() {
                    *value = scratch_dir.join(value.as_str()).display().to_string();
                }
            }
        }
        self
    }

    /// Drop every token equal to one of `tokens`.
    pub fn strip(mut self, tokens: &[String]) -> Self {
        self.args.retain(|arg| {
            let rendered = arg.to_string();
            !tokens.iter().any(|t| *t == rendered)
        });
        self
    }
}

impl fmt::Display for PayloadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.args.iter().map(Arg::to_string).collect();
        f.write_str(rendered.join(" ").trim())
    }
}
