//! Post-command invocation for freshly landed files.
//!
//! The configured template is expanded (`%s` is the file path, `%I` the
//! peer identity, `%%` a literal percent) and run through the shell. The
//! session loop never waits on it; the exit status is logged when the
//! child finishes.

use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PostCommand {
    template: String,
}

impl PostCommand {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn expand(&self, path: &Path, ident: &str) -> String {
        let mut out = String::with_capacity(self.template.len() + 64);
        let mut chars = self.template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('s') => out.push_str(&path.display().to_string()),
                Some('I') => out.push_str(ident),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }

    /// Fire and forget; completion is reported via the log.
    pub fn spawn(&self, path: &Path, ident: &str) {
        let command = self.expand(path, ident);
        info!(%command, "running post command");
        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .spawn();
        match spawned {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => {}
                        Ok(status) => warn!(%command, %status, "post command failed"),
                        Err(err) => warn!(%command, %err, "post command did not run"),
                    }
                });
            }
            Err(err) => warn!(%command, %err, "cannot spawn post command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn expands_placeholders() {
        let cmd = PostCommand::new("notify %I %s 100%%");
        let path = PathBuf::from("/srv/incoming/data.bin");
        assert_eq!(
            cmd.expand(&path, "upstream"),
            "notify upstream /srv/incoming/data.bin 100%"
        );
    }

    #[test]
    fn stray_percent_is_preserved() {
        let cmd = PostCommand::new("echo %q %");
        assert_eq!(cmd.expand(Path::new("/f"), "id"), "echo %q %");
    }
}
