//! Helm CLI wrapper

use crate::error::{ResourceError, Result};
use crate::manager::{ChartSpec, ReleaseInfo};
use crate::upgrade::split_chart_version;
use nodeforge_workflow::StepContext;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// One row of `helm list -o json`
#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    revision: String,
    status: String,
    chart: String,
}

/// Runs `helm` as a subprocess
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
    kubeconfig: Option<PathBuf>,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
            kubeconfig: None,
        }
    }
}

impl HelmCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    async fn run(&self, args: &[String], ctx: &StepContext) -> Result<String> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command_line, "Running helm");

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.env("KUBECONFIG", kubeconfig);
        }

        let output = ctx
            .guard(command.output())
            .await?
            .map_err(|source| ResourceError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ResourceError::Helm {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Latest revision of `release`, with its user-supplied values
    pub async fn release(
        &self,
        release: &str,
        namespace: &str,
        ctx: &StepContext,
    ) -> Result<Option<ReleaseInfo>> {
        let list = self
            .run(
                &args([
                    "list",
                    "--namespace",
                    namespace,
                    "--filter",
                    &format!("^{release}$"),
                    "--all",
                    "-o",
                    "json",
                ]),
                ctx,
            )
            .await?;
        let Some(mut info) = parse_list(&list, release)? else {
            return Ok(None);
        };

        let values = self
            .run(
                &args(["get", "values", release, "--namespace", namespace, "-o", "json"]),
                ctx,
            )
            .await?;
        info.values = parse_values(&values)?;
        Ok(Some(info))
    }

    pub async fn install(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        self.deploy("install", chart, ctx).await
    }

    pub async fn upgrade(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        self.deploy("upgrade", chart, ctx).await
    }

    async fn deploy(&self, verb: &str, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        let values = values_file(&chart.values)?;
        let mut argv = args([
            verb,
            &chart.release,
            &chart.chart,
            "--namespace",
            &chart.namespace,
            "--version",
            &chart.version,
        ]);
        argv.push("--values".to_string());
        argv.push(values.path().display().to_string());
        if let Some(repo) = &chart.repo {
            argv.push("--repo".to_string());
            argv.push(repo.clone());
        }
        self.run(&argv, ctx).await?;
        Ok(())
    }

    /// Uninstall a release; a release that does not exist is not an error
    pub async fn uninstall(&self, release: &str, namespace: &str, ctx: &StepContext) -> Result<()> {
        match self
            .run(&args(["uninstall", release, "--namespace", namespace]), ctx)
            .await
        {
            Ok(_) => Ok(()),
            Err(ResourceError::Helm { stderr, .. }) if stderr.contains("not found") => {
                debug!(release, "Release already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn rollback(
        &self,
        release: &str,
        namespace: &str,
        revision: u32,
        ctx: &StepContext,
    ) -> Result<()> {
        self.run(
            &args([
                "rollback",
                release,
                &revision.to_string(),
                "--namespace",
                namespace,
            ]),
            ctx,
        )
        .await?;
        Ok(())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Chart values as a JSON file; removed when dropped
fn values_file(values: &serde_json::Value) -> Result<tempfile::NamedTempFile> {
    let io_error = |source| ResourceError::Io {
        context: "helm values file".to_string(),
        source,
    };
    let mut file = tempfile::Builder::new()
        .prefix("nodeforge-values-")
        .suffix(".json")
        .tempfile()
        .map_err(io_error)?;
    let body = match values {
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    file.write_all(body.as_bytes()).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    Ok(file)
}

fn parse_list(output: &str, release: &str) -> Result<Option<ReleaseInfo>> {
    let entries: Vec<ListEntry> =
        serde_json::from_str(output).map_err(|source| ResourceError::Json {
            context: "helm list".to_string(),
            source,
        })?;
    let Some(entry) = entries.into_iter().find(|e| e.name == release) else {
        return Ok(None);
    };

    let (chart, version) = split_chart_version(&entry.chart).ok_or_else(|| {
        ResourceError::Failed(format!("cannot parse chart '{}' from helm list", entry.chart))
    })?;
    let revision = entry.revision.parse().map_err(|_| {
        ResourceError::Failed(format!("cannot parse revision '{}' from helm list", entry.revision))
    })?;
    Ok(Some(ReleaseInfo {
        name: entry.name,
        namespace: entry.namespace,
        revision,
        chart: chart.to_string(),
        chart_version: version.to_string(),
        status: entry.status,
        values: serde_json::Value::Null,
    }))
}

fn parse_values(output: &str) -> Result<serde_json::Value> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(trimmed).map_err(|source| ResourceError::Json {
        context: "helm get values".to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIST: &str = r#"[{"name":"cert-manager","namespace":"cert-manager","revision":"3","updated":"2024-03-01 10:00:00.000000000 +0000 UTC","status":"deployed","chart":"cert-manager-v1.14.4","app_version":"v1.14.4"}]"#;

    #[test]
    fn test_parse_list() {
        let info = parse_list(LIST, "cert-manager").unwrap().unwrap();
        assert_eq!(info.revision, 3);
        assert_eq!(info.chart, "cert-manager");
        assert_eq!(info.chart_version, "v1.14.4");
        assert_eq!(info.status, "deployed");
    }

    #[test]
    fn test_parse_list_without_release() {
        assert!(parse_list("[]", "cert-manager").unwrap().is_none());
        assert!(parse_list(LIST, "cert").unwrap().is_none());
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_values("null\n").unwrap(), serde_json::Value::Null);
        assert_eq!(parse_values("").unwrap(), serde_json::Value::Null);
        assert_eq!(
            parse_values(r#"{"installCRDs":true}"#).unwrap(),
            json!({"installCRDs": true})
        );
        assert!(matches!(
            parse_values("installCRDs: true"),
            Err(ResourceError::Json { .. })
        ));
    }

    #[test]
    fn test_values_file_contents() {
        let file = values_file(&json!({"replicas": 2})).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written, r#"{"replicas":2}"#);

        let empty = values_file(&serde_json::Value::Null).unwrap();
        assert_eq!(std::fs::read_to_string(empty.path()).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let helm = HelmCli::new().with_binary("/nonexistent/helm");
        let err = helm
            .rollback("cert-manager", "cert-manager", 1, &StepContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Spawn { .. }));
    }
}
