//! Parses the engine's own command line. This is a fixed contract shared
//! with companion processes and registration entries (resume, uninstall and
//! modify strings), so it is parsed by hand rather than through a CLI
//! framework: switch names are case-insensitive, `-` and `/` both introduce
//! a switch, and unknown switches are collected for the host application.

use std::path::PathBuf;

use thiserror::Error;

use ember_bundle_types::BundleAction;

/// How much UI the host application shows.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DisplayMode {
    /// Full interactive UI.
    #[default]
    Full,
    /// Progress only, no questions.
    Passive,
    /// No UI at all.
    Quiet,
}

/// The companion role this process was started in, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionMode {
    /// Elevated child of an unelevated parent.
    Elevated {
        /// Pipe connection name.
        pipe_name: String,
        /// Handshake secret.
        secret: String,
        /// Parent process id.
        parent_pid: u32,
    },
    /// Unelevated child spawned from an elevated parent.
    Unelevated {
        /// Pipe connection name.
        pipe_name: String,
        /// Handshake secret.
        secret: String,
        /// Parent process id.
        parent_pid: u32,
    },
    /// Embedded child of a parent bundle.
    Embedded {
        /// Pipe connection name.
        pipe_name: String,
        /// Handshake secret.
        secret: String,
        /// Parent process id.
        parent_pid: u32,
        /// Fire-and-forget variant: the parent does not wait for
        /// completion.
        asynchronous: bool,
    },
}

/// The parsed engine command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineCommandLine {
    /// Action override from `-uninstall`, `-modify`, `-repair`, `-layout`.
    pub action_override: Option<BundleAction>,
    /// Layout directory following `-layout`, when given.
    pub layout_directory: Option<PathBuf>,
    /// Companion role, when spawned as a child process.
    pub companion: Option<CompanionMode>,
    /// Resuming after a reboot.
    pub runonce: bool,
    /// Display mode.
    pub display: DisplayMode,
    /// Provider keys whose dependency checks are suppressed.
    pub ignored_dependencies: Vec<String>,
    /// Ancestor bundle ids forwarded by the launching bundle.
    pub ancestors: Vec<String>,
    /// Unrecognized arguments, forwarded to the host application.
    pub forwarded: Vec<String>,
}

/// An error parsing the command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandLineError {
    /// A switch is missing its following token(s).
    #[error("switch '-{0}' is missing its argument")]
    MissingArgument(String),

    /// A numeric token did not parse.
    #[error("switch '-{switch}' argument '{value}' is not a number")]
    InvalidNumber {
        /// The switch name.
        switch: String,
        /// The rejected token.
        value: String,
    },
}

fn switch_name(token: &str) -> Option<&str> {
    token
        .strip_prefix('-')
        .or_else(|| token.strip_prefix('/'))
        .filter(|name| !name.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses the arguments (without the program name).
pub fn parse(
    args: impl IntoIterator<Item = String>,
) -> Result<EngineCommandLine, CommandLineError> {
    fn next_token(
        args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
        switch: &str,
    ) -> Result<String, CommandLineError> {
        args.next()
            .ok_or_else(|| CommandLineError::MissingArgument(switch.to_owned()))
    }

    let mut parsed = EngineCommandLine::default();
    let mut args = args.into_iter().peekable();

    while let Some(token) = args.next() {
        let Some(name) = switch_name(&token) else {
            parsed.forwarded.push(token);
            continue;
        };
        let name_lower = name.to_ascii_lowercase();

        match name_lower.as_str() {
            "elevated" | "unelevated" | "embedded" | "embedded-async" => {
                let pipe_name = next_token(&mut args, &name_lower)?;
                let secret = next_token(&mut args, &name_lower)?;
                let pid_token = next_token(&mut args, &name_lower)?;
                let parent_pid =
                    pid_token
                        .parse()
                        .map_err(|_| CommandLineError::InvalidNumber {
                            switch: name_lower.clone(),
                            value: pid_token.clone(),
                        })?;
                parsed.companion = Some(match name_lower.as_str() {
                    "elevated" => CompanionMode::Elevated {
                        pipe_name,
                        secret,
                        parent_pid,
                    },
                    "unelevated" => CompanionMode::Unelevated {
                        pipe_name,
                        secret,
                        parent_pid,
                    },
                    _ => CompanionMode::Embedded {
                        pipe_name,
                        secret,
                        parent_pid,
                        asynchronous: name_lower == "embedded-async",
                    },
                });
            }
            "runonce" => parsed.runonce = true,
            "uninstall" => parsed.action_override = Some(BundleAction::Uninstall),
            "modify" => parsed.action_override = Some(BundleAction::Modify),
            "repair" => parsed.action_override = Some(BundleAction::Repair),
            "layout" => {
                parsed.action_override = Some(BundleAction::Layout);
                // The directory token is optional; a following switch means
                // it was omitted.
                if let Some(candidate) = args.peek() {
                    if switch_name(candidate).is_none() {
                        parsed.layout_directory = args.next().map(PathBuf::from);
                    }
                }
            }
            "ignoredependencies" => {
                parsed.ignored_dependencies = split_list(&next_token(&mut args, &name_lower)?);
            }
            "ancestors" => {
                parsed.ancestors = split_list(&next_token(&mut args, &name_lower)?);
            }
            "quiet" => parsed.display = DisplayMode::Quiet,
            "passive" => parsed.display = DisplayMode::Passive,
            _ => parsed.forwarded.push(token),
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use ember_bundle_types::BundleAction;

    use super::{parse, CommandLineError, CompanionMode, DisplayMode};

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_elevated_switch() {
        let parsed = parse(args(&["-elevated", "Burn.abc", "s3cret", "4242"])).unwrap();
        assert_eq!(
            parsed.companion,
            Some(CompanionMode::Elevated {
                pipe_name: "Burn.abc".to_owned(),
                secret: "s3cret".to_owned(),
                parent_pid: 4242,
            })
        );
    }

    #[test]
    fn test_embedded_async_switch() {
        let parsed = parse(args(&["/embedded-async", "Burn.x", "s", "7"])).unwrap();
        assert_matches!(
            parsed.companion,
            Some(CompanionMode::Embedded {
                asynchronous: true,
                ..
            })
        );
    }

    #[test]
    fn test_action_overrides_and_display() {
        let parsed = parse(args(&["-uninstall", "-quiet"])).unwrap();
        assert_eq!(parsed.action_override, Some(BundleAction::Uninstall));
        assert_eq!(parsed.display, DisplayMode::Quiet);
    }

    #[test]
    fn test_layout_with_and_without_directory() {
        let parsed = parse(args(&["-layout", r"D:\layout"])).unwrap();
        assert_eq!(parsed.action_override, Some(BundleAction::Layout));
        assert_eq!(
            parsed.layout_directory.as_deref(),
            Some(std::path::Path::new(r"D:\layout"))
        );

        let parsed = parse(args(&["-layout", "-quiet"])).unwrap();
        assert_eq!(parsed.layout_directory, None);
        assert_eq!(parsed.display, DisplayMode::Quiet);
    }

    #[test]
    fn test_lists_split_on_semicolons() {
        let parsed = parse(args(&[
            "-ignoredependencies",
            "a;b;c",
            "-ancestors",
            "{B1};{B2}",
        ]))
        .unwrap();
        assert_eq!(parsed.ignored_dependencies, vec!["a", "b", "c"]);
        assert_eq!(parsed.ancestors, vec!["{B1}", "{B2}"]);
    }

    #[test]
    fn test_unknown_switches_are_forwarded() {
        let parsed = parse(args(&["-log", "x.txt", "positional"])).unwrap();
        // `-log` is not an engine switch; both tokens pass through (the
        // value token is positional from the engine's point of view).
        assert_eq!(parsed.forwarded, vec!["-log", "x.txt", "positional"]);
    }

    #[test]
    fn test_missing_argument() {
        assert_matches!(
            parse(args(&["-ancestors"])),
            Err(CommandLineError::MissingArgument(_))
        );
    }

    #[test]
    fn test_case_insensitive_switches() {
        let parsed = parse(args(&["-UNINSTALL", "/Passive"])).unwrap();
        assert_eq!(parsed.action_override, Some(BundleAction::Uninstall));
        assert_eq!(parsed.display, DisplayMode::Passive);
    }
}
