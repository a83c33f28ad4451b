use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::path_utils;
use crate::pipeline::variant::{compute_day_variant, DayVariant};

/// Format of the date string handed to templates and stages
pub const DATE_FORMAT: &str = "%Y_%m_%d";

/// Environment variable name and the context variable it carries
const ENV_EXPORTS: [(&str, &str); 8] = [
    ("CI_PROJECT_NAME", "project"),
    ("CI_PIPELINE_ID", "pipeline_id"),
    ("CI_JOB_ID", "run_id"),
    ("ANDROID_NDK_HOME", "ndk_home"),
    ("DATE_STR", "date"),
    ("DAY_OF_WEEK", "day_of_week"),
    ("BENCHCI_VARIANT", "variant"),
    ("CI_PROJECT_OUTPUT_PATH", "output_dir"),
];

/// Resolved variables for one pipeline run.
///
/// Built once at run start and only read afterwards. Templates reference the
/// variables as `{name}`; stages additionally receive them as environment
/// variables (see [`RunContext::env_vars`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    date: NaiveDate,
    variant: DayVariant,
    base_dir: PathBuf,
    output_dir: PathBuf,
    vars: BTreeMap<String, String>,
}

/// Builder for RunContext
#[derive(Debug, Clone)]
pub struct RunContextBuilder {
    date: NaiveDate,
    variant: Option<DayVariant>,
    project: String,
    pipeline_id: String,
    run_id: String,
    ndk_home: Option<String>,
    base_dir: PathBuf,
    extra: BTreeMap<String, String>,
}

impl RunContextBuilder {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            variant: None,
            project: "local".to_string(),
            pipeline_id: "0".to_string(),
            run_id: "0".to_string(),
            ndk_home: None,
            base_dir: PathBuf::from("."),
            extra: BTreeMap::new(),
        }
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn pipeline_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_id = id.into();
        self
    }

    pub fn run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = id.into();
        self
    }

    /// Toolchain root, exported as `ANDROID_NDK_HOME`
    pub fn ndk_home(mut self, path: Option<String>) -> Self {
        self.ndk_home = path;
        self
    }

    /// Directory relative output paths and stage commands are anchored to
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Force a variant instead of deriving it from the date
    pub fn variant(mut self, variant: Option<DayVariant>) -> Self {
        self.variant = variant;
        self
    }

    /// Add a template variable; built-in names take precedence
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolve the output directory from `output_template` and freeze the context
    pub fn build(self, output_template: &str) -> RunContext {
        let variant = self.variant.unwrap_or_else(|| compute_day_variant(self.date));

        let mut vars = self.extra;
        vars.insert("date".into(), self.date.format(DATE_FORMAT).to_string());
        vars.insert(
            "day_of_week".into(),
            self.date.weekday().number_from_monday().to_string(),
        );
        vars.insert("variant".into(), variant.to_string());
        vars.insert("project".into(), self.project);
        vars.insert("pipeline_id".into(), self.pipeline_id);
        vars.insert("run_id".into(), self.run_id);
        if let Some(ndk_home) = self.ndk_home {
            vars.insert("ndk_home".into(), ndk_home);
        }

        let output_dir = resolve_with(output_template, &vars, &self.base_dir);
        vars.insert(
            "output_dir".into(),
            output_dir.to_string_lossy().into_owned(),
        );

        RunContext {
            date: self.date,
            variant,
            base_dir: self.base_dir,
            output_dir,
            vars,
        }
    }
}

impl RunContext {
    pub fn builder(date: NaiveDate) -> RunContextBuilder {
        RunContextBuilder::new(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Date string in `%Y_%m_%d` form
    pub fn date_str(&self) -> &str {
        self.var("date").unwrap_or_default()
    }

    pub fn variant(&self) -> DayVariant {
        self.variant
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Replace every `{name}` placeholder with the matching context variable.
    /// Unknown placeholders are left untouched.
    pub fn substitute(&self, template: &str) -> String {
        substitute_vars(template, &self.vars)
    }

    /// Like [`RunContext::substitute`], with every inserted value quoted for
    /// a POSIX shell unless it only holds safe characters
    pub fn substitute_command(&self, template: &str) -> String {
        substitute_with(template, &self.vars, shell_quote)
    }

    /// Environment exported to every stage process
    pub fn env_vars(&self) -> HashMap<String, String> {
        ENV_EXPORTS
            .iter()
            .filter_map(|(key, var)| self.var(var).map(|v| (key.to_string(), v.to_string())))
            .collect()
    }
}

/// Build the per-run output directory from a template.
///
/// `{name}` placeholders come from the context variables, `$VAR` references
/// are looked up in the context as well (never in the process environment),
/// and relative results are anchored at the context base directory. The
/// function touches no files, so equal contexts always give equal paths.
pub fn resolve_output_path(template: &str, context: &RunContext) -> PathBuf {
    resolve_with(template, &context.vars, &context.base_dir)
}

fn resolve_with(template: &str, vars: &BTreeMap<String, String>, base_dir: &Path) -> PathBuf {
    let substituted = substitute_vars(template, vars);
    let aliases = env_aliases(vars);
    let expanded = shellexpand::full_with_context_no_errors(
        &substituted,
        || std::env::var("HOME").ok(),
        |name: &str| vars.get(name).or_else(|| aliases.get(name)).cloned(),
    );
    path_utils::absolutize(Path::new(expanded.as_ref()), base_dir)
}

/// CI-style names for the built-in variables, usable as `$CI_PIPELINE_ID`
fn env_aliases(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    ENV_EXPORTS
        .iter()
        .filter_map(|(alias, var)| vars.get(*var).map(|v| (alias.to_string(), v.clone())))
        .collect()
}

fn substitute_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    substitute_with(template, vars, str::to_string)
}

/// Single pass over `template`; inserted values are never scanned again
fn substitute_with(
    template: &str,
    vars: &BTreeMap<String, String>,
    render: impl Fn(&str) -> String,
) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let known = after
            .find('}')
            .and_then(|close| vars.get(&after[..close]).map(|value| (value, close)));
        match known {
            Some((value, close)) => {
                result.push_str(&render(value));
                rest = &after[close + 1..];
            }
            None => {
                result.push('{');
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

/// Quote `arg` for a POSIX shell unless it only holds safe characters
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=.,/:+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn context(template: &str) -> RunContext {
        RunContext::builder(monday())
            .project("mobile-ai-bench")
            .pipeline_id("4711")
            .run_id("42")
            .base_dir("/work")
            .build(template)
    }

    #[test]
    fn test_builtin_vars() {
        let ctx = context("out");
        assert_eq!(ctx.date_str(), "2024_01_01");
        assert_eq!(ctx.var("day_of_week"), Some("1"));
        assert_eq!(ctx.var("variant"), Some("weekday"));
        assert_eq!(ctx.var("project"), Some("mobile-ai-bench"));
        assert_eq!(ctx.variant(), DayVariant::Weekday);
        assert_eq!(ctx.var("ndk_home"), None);
    }

    #[test]
    fn test_output_dir_from_placeholders() {
        let ctx = context("/bench-output/{project}/{pipeline_id}/{date}");
        assert_eq!(
            ctx.output_dir(),
            Path::new("/bench-output/mobile-ai-bench/4711/2024_01_01")
        );
    }

    #[test]
    fn test_relative_output_dir_anchored_at_base() {
        let ctx = context("output/{run_id}");
        assert_eq!(ctx.output_dir(), Path::new("/work/output/42"));
    }

    #[test]
    fn test_dollar_vars_resolved_from_context() {
        let ctx = context("/out/$CI_PROJECT_NAME/${CI_PIPELINE_ID}");
        assert_eq!(ctx.output_dir(), Path::new("/out/mobile-ai-bench/4711"));
    }

    #[test]
    fn test_resolve_output_path_is_idempotent() {
        let ctx = context("output/{project}/{pipeline_id}");
        let first = resolve_output_path("output/{project}/{pipeline_id}/{run_id}", &ctx);
        let second = resolve_output_path("output/{project}/{pipeline_id}/{run_id}", &ctx);
        assert_eq!(first, second);
        assert_eq!(first, Path::new("/work/output/mobile-ai-bench/4711/42"));
    }

    #[test]
    fn test_substitute_leaves_unknown_placeholders() {
        let ctx = context("out");
        assert_eq!(
            ctx.substitute("echo {project} {unknown} {date}"),
            "echo mobile-ai-bench {unknown} 2024_01_01"
        );
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let ctx = RunContext::builder(monday())
            .project("{run_id}")
            .run_id("42")
            .build("out");
        assert_eq!(ctx.substitute("{project}/{run_id}"), "{run_id}/42");
        assert_eq!(ctx.substitute("{{date}}"), "{2024_01_01}");
    }

    #[test]
    fn test_substitute_command_quotes_values() {
        let ctx = RunContext::builder(monday())
            .project("bench; rm -rf /")
            .build("out");
        assert_eq!(
            ctx.substitute_command("report --project={project} --date={date}"),
            "report --project='bench; rm -rf /' --date=2024_01_01"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_extra_vars_cannot_shadow_builtins() {
        let ctx = RunContext::builder(monday())
            .var("project", "spoofed")
            .var("abi", "arm64-v8a")
            .build("out");
        assert_eq!(ctx.var("project"), Some("local"));
        assert_eq!(ctx.var("abi"), Some("arm64-v8a"));
    }

    #[test]
    fn test_forced_variant() {
        let ctx = RunContext::builder(monday())
            .variant(Some(DayVariant::Weekend))
            .build("out");
        assert_eq!(ctx.variant(), DayVariant::Weekend);
        assert_eq!(ctx.var("day_of_week"), Some("1"));
    }

    #[test]
    fn test_env_vars() {
        let ctx = RunContext::builder(monday())
            .project("p")
            .pipeline_id("7")
            .ndk_home(Some("/opt/android-ndk-r15c".to_string()))
            .base_dir("/work")
            .build("out/{pipeline_id}");
        let env = ctx.env_vars();
        assert_eq!(env["CI_PROJECT_NAME"], "p");
        assert_eq!(env["CI_PIPELINE_ID"], "7");
        assert_eq!(env["ANDROID_NDK_HOME"], "/opt/android-ndk-r15c");
        assert_eq!(env["DATE_STR"], "2024_01_01");
        assert_eq!(env["DAY_OF_WEEK"], "1");
        assert_eq!(env["CI_PROJECT_OUTPUT_PATH"], "/work/out/7");
    }
}
