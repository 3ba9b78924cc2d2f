use bskit_common::BuildSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A fully rendered command line, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
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

    /// Shell-ish rendering for the echo line. Arguments containing
    /// whitespace or quotes are single-quoted.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                    format!("'{}'", part.replace('\'', r"'\''"))
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub const DEFAULT_PROGRAM: &str = "pack";
pub const DEFAULT_BUILDER_IMAGE: &str = "paketobuildpacks/builder-jammy-base";

pub fn default_args() -> Vec<String> {
    [
        "build",
        "{name}",
        "--path",
        "{directory}",
        "--builder",
        DEFAULT_BUILDER_IMAGE,
        "--creation-time",
        "now",
        "--platform",
        "linux/{platform}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Configured shape of the build command. Rendered once per `BuildSpec`.
///
/// Placeholders: `{directory}`, `{platform}`, `{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Image name; falls back to a slug of the directory name.
    pub image_name: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: default_args(),
            image_name: None,
            env: BTreeMap::new(),
        }
    }
}

impl CommandTemplate {
    pub fn image_name_for(&self, spec: &BuildSpec) -> String {
        if let Some(name) = self.image_name.as_deref().map(str::trim)
            && !name.is_empty()
        {
            return name.to_string();
        }
        let slug = spec
            .target_directory
            .file_name()
            .map(|n| slugify(&n.to_string_lossy(), 63))
            .unwrap_or_default();
        if slug.is_empty() { "app".to_string() } else { slug }
    }

    pub fn render(&self, spec: &BuildSpec) -> CommandSpec {
        let directory = spec.target_directory.to_string_lossy();
        let name = self.image_name_for(spec);
        let vars = [
            ("{directory}", &*directory),
            ("{platform}", spec.platform.as_str()),
            ("{name}", name.as_str()),
        ];
        let expand = |s: &str| substitute(s, &vars);

        CommandSpec {
            program: expand(&self.program),
            args: self.args.iter().map(|a| expand(a)).collect(),
            working_dir: spec.target_directory.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand(v)))
                .collect(),
        }
    }

    pub fn mentions_directory(&self) -> bool {
        self.program.contains("{directory}") || self.args.iter().any(|a| a.contains("{directory}"))
    }
}

/// Replace placeholders in one left-to-right pass. Substituted text is
/// never rescanned; unknown `{...}` is kept as written.
fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match vars.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Lowercase, dash-separated slug limited to `max_len` bytes.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bskit_common::Platform;

    #[test]
    fn default_template_renders_pack_build() {
        let spec = BuildSpec::new("/home/dev/My App", Platform::Arm64);
        let cmd = CommandTemplate::default().render(&spec);
        assert_eq!(cmd.program, "pack");
        assert_eq!(
            cmd.args,
            vec![
                "build",
                "my-app",
                "--path",
                "/home/dev/My App",
                "--builder",
                "paketobuildpacks/builder-jammy-base",
                "--creation-time",
                "now",
                "--platform",
                "linux/arm64",
            ]
        );
        assert_eq!(cmd.working_dir, PathBuf::from("/home/dev/My App"));
    }

    #[test]
    fn configured_image_name_wins() {
        let template = CommandTemplate {
            image_name: Some("test-app".into()),
            ..Default::default()
        };
        let spec = BuildSpec::new("/src/whatever", Platform::Amd64);
        assert_eq!(template.render(&spec).args[1], "test-app");
    }

    #[test]
    fn name_falls_back_to_app() {
        let template = CommandTemplate::default();
        assert_eq!(template.image_name_for(&BuildSpec::new("/", Platform::Amd64)), "app");
        assert_eq!(template.image_name_for(&BuildSpec::new("/src/___", Platform::Amd64)), "app");
    }

    #[test]
    fn env_values_are_expanded() {
        let mut template = CommandTemplate::default();
        template.env.insert("TARGET_ARCH".into(), "{platform}".into());
        let cmd = template.render(&BuildSpec::new("/src/app", Platform::Amd64));
        assert_eq!(cmd.env.get("TARGET_ARCH").map(String::as_str), Some("amd64"));
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let template = CommandTemplate {
            image_name: Some("test-app".into()),
            ..Default::default()
        };
        let cmd = template.render(&BuildSpec::new("/src/{name}", Platform::Amd64));
        assert_eq!(cmd.args[1], "test-app");
        assert_eq!(cmd.args[3], "/src/{name}");

        let cmd = CommandTemplate::default().render(&BuildSpec::new("/src/{platform}", Platform::Arm64));
        assert_eq!(cmd.args[3], "/src/{platform}");
        assert_eq!(cmd.args[9], "linux/arm64");
    }

    #[test]
    fn unknown_placeholders_are_kept() {
        assert_eq!(
            substitute("{a}-{platform}-{", &[("{platform}", "amd64")]),
            "{a}-amd64-{"
        );
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let cmd = CommandSpec::new("sh", "/tmp").args(["-c", "echo hi"]);
        assert_eq!(cmd.display(), "sh -c 'echo hi'");
        let cmd = CommandSpec::new("pack", "/tmp").arg("it's");
        assert_eq!(cmd.display(), r"pack 'it'\''s'");
    }

    #[test]
    fn detects_missing_directory_placeholder() {
        assert!(CommandTemplate::default().mentions_directory());
        let template = CommandTemplate {
            args: vec!["build".into()],
            ..Default::default()
        };
        assert!(!template.mentions_directory());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World", 50), "hello-world");
        assert_eq!(slugify("fix: bug #123", 50), "fix-bug-123");
        assert_eq!(slugify("a--b", 50), "a-b");
        assert_eq!(slugify("Long title here", 8), "long-tit");
        assert_eq!(slugify("abc def", 4), "abc");
    }
}
