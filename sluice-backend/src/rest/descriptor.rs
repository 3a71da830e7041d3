//! Job descriptors
//!
//! Renders the server-side job for one step: a freestyle project pinned to the
//! activity's worker, with one string parameter per run variable, a git SCM
//! block for checkout steps and a single shell build step otherwise.

use sluice_core::domain::activity::Activity;
use sluice_core::domain::pipeline::{BuildStep, ScmStep, StepKind, TaskStep};
use std::fmt::Write;

use crate::error::{BackendError, Result};

/// Renders the job descriptor for step `step` of stage `stage`
pub(crate) fn job_descriptor(
    activity: &Activity,
    stage: usize,
    step: usize,
    workspace_root: &str,
) -> Result<String> {
    let def = activity
        .step_def(stage, step)
        .ok_or_else(|| BackendError::NotFound(format!("step {stage}.{step}")))?;

    let (scm, command) = match &def.kind {
        StepKind::Scm(scm) => (git_scm(scm, activity.commit_info.as_deref()), None),
        StepKind::Task(task) => (null_scm(), Some(task_command(activity, task))),
        StepKind::Build(build) => (null_scm(), Some(build_command(build))),
        _ => {
            return Err(BackendError::Unsupported(format!(
                "{} steps",
                def.step_type()
            )));
        }
    };

    let mut xml = String::from("<?xml version='1.1' encoding='UTF-8'?>\n<project>\n");
    let _ = writeln!(xml, "  <description>{}</description>", escape(&def.name));
    xml.push_str("  <keepDependencies>false</keepDependencies>\n");
    xml.push_str(&parameters(activity));
    xml.push_str(&scm);
    let _ = writeln!(xml, "  <assignedNode>{}</assignedNode>", escape(&activity.node_name));
    xml.push_str("  <canRoam>false</canRoam>\n  <concurrentBuild>false</concurrentBuild>\n");
    let _ = writeln!(
        xml,
        "  <customWorkspace>{}/{}</customWorkspace>",
        escape(workspace_root),
        escape(&activity.id)
    );

    xml.push_str("  <builders>\n");
    if let Some(command) = command {
        let _ = writeln!(
            xml,
            "    <hudson.tasks.Shell>\n      <command>{}</command>\n    </hudson.tasks.Shell>",
            escape(&command)
        );
    }
    xml.push_str("  </builders>\n");

    xml.push_str("  <buildWrappers>\n    <hudson.plugins.timestamper.TimestamperBuildWrapper/>\n");
    if def.timeout > 0 {
        let _ = writeln!(
            xml,
            "    <hudson.plugins.build__timeout.BuildTimeoutWrapper>\n      \
             <strategy class=\"hudson.plugins.build_timeout.impl.AbsoluteTimeOutStrategy\">\n        \
             <timeoutMinutes>{}</timeoutMinutes>\n      </strategy>\n      \
             <operationList><hudson.plugins.build__timeout.operations.FailOperation/></operationList>\n    \
             </hudson.plugins.build__timeout.BuildTimeoutWrapper>",
            def.timeout
        );
    }
    xml.push_str("  </buildWrappers>\n</project>\n");
    Ok(xml)
}

fn parameters(activity: &Activity) -> String {
    if activity.env_vars.is_empty() {
        return String::new();
    }
    let mut xml = String::from(
        "  <properties>\n    <hudson.model.ParametersDefinitionProperty>\n      <parameterDefinitions>\n",
    );
    for (key, value) in &activity.env_vars {
        let _ = writeln!(
            xml,
            "        <hudson.model.StringParameterDefinition><name>{}</name><defaultValue>{}</defaultValue></hudson.model.StringParameterDefinition>",
            escape(key),
            escape(value)
        );
    }
    xml.push_str("      </parameterDefinitions>\n    </hudson.model.ParametersDefinitionProperty>\n  </properties>\n");
    xml
}

/// A pinned commit replaces the branch so reruns build the same revision
fn git_scm(scm: &ScmStep, commit: Option<&str>) -> String {
    let branch = match commit {
        Some(sha) if !sha.is_empty() => sha,
        _ if scm.branch.is_empty() => "master",
        _ => scm.branch.as_str(),
    };
    let mut xml = String::from("  <scm class=\"hudson.plugins.git.GitSCM\">\n");
    let _ = writeln!(
        xml,
        "    <userRemoteConfigs><hudson.plugins.git.UserRemoteConfig><url>{}</url>{}</hudson.plugins.git.UserRemoteConfig></userRemoteConfigs>",
        escape(&scm.repository),
        if scm.git_user.is_empty() {
            String::new()
        } else {
            format!("<credentialsId>{}</credentialsId>", escape(&scm.git_user))
        }
    );
    let _ = writeln!(
        xml,
        "    <branches><hudson.plugins.git.BranchSpec><name>{}</name></hudson.plugins.git.BranchSpec></branches>",
        escape(branch)
    );
    xml.push_str("  </scm>\n");
    xml
}

fn null_scm() -> String {
    "  <scm class=\"hudson.scm.NullSCM\"/>\n".to_string()
}

fn task_command(activity: &Activity, task: &TaskStep) -> String {
    let label = format!("activityid={}", activity.id);
    let mut args = vec!["docker".to_string(), "run".to_string()];

    if task.is_service {
        let alias = if task.alias.is_empty() { "service" } else { task.alias.as_str() };
        args.push("-d".into());
        args.push(format!("--name={alias}_{}", activity.id));
    } else {
        args.push("--rm".into());
        args.push("-v".into());
        args.push("\"$WORKSPACE\":/workspace".into());
        args.push("-w".into());
        args.push("/workspace".into());
    }
    args.push(format!("--label={label}"));

    for key in activity.env_vars.keys() {
        args.push(format!("-e {key}"));
    }
    for entry in &task.env {
        args.push(format!("-e {}", double_quote(entry)));
    }
    for service in &task.services {
        args.push(format!("--link={service}_{}:{service}", activity.id));
    }

    if !task.shell_script.is_empty() {
        args.push("--entrypoint=/bin/sh".into());
        args.push(double_quote(&task.image));
        args.push("-c".into());
        args.push(single_quote(&task.shell_script));
    } else {
        if !task.entrypoint.is_empty() {
            args.push(format!("--entrypoint={}", double_quote(&task.entrypoint)));
        }
        args.push(double_quote(&task.image));
        if !task.args.is_empty() {
            args.push(task.args.clone());
        }
    }
    args.join(" ")
}

fn build_command(build: &BuildStep) -> String {
    let mut script = String::new();
    let dockerfile = if !build.dockerfile.is_empty() {
        let _ = writeln!(
            script,
            "cat > .sluice.Dockerfile <<'SLUICE_DOCKERFILE'\n{}\nSLUICE_DOCKERFILE",
            build.dockerfile
        );
        ".sluice.Dockerfile"
    } else if !build.dockerfile_path.is_empty() {
        build.dockerfile_path.as_str()
    } else {
        "Dockerfile"
    };
    let context = if build.build_path.is_empty() {
        "."
    } else {
        build.build_path.as_str()
    };
    let _ = writeln!(
        script,
        "docker build -t {} -f {} {}",
        double_quote(&build.target_image),
        double_quote(dockerfile),
        double_quote(context)
    );
    if build.push {
        let _ = writeln!(script, "docker push {}", double_quote(&build.target_image));
    }
    script
}

/// Quotes for the shell with no expansion inside
fn single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Quotes for the shell keeping `$VAR` references live
fn double_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
