//! Worker-related API endpoints

use reqwest::Method;
use serde::Deserialize;

use super::RestBackend;
use crate::error::Result;

/// Names the server uses for its own built-in executor
const BUILT_IN_NODES: [&str; 2] = ["master", "Built-In Node"];

/// Runs a shell command on a named worker through the server's script console
const SCRIPT_SKELETON: &str = r#"import hudson.util.RemotingDiagnostics
def node = "{node}"
def cmd = "{command}"
def remote = "def proc = ['bash', '-c', " + groovy.json.JsonOutput.toJson(cmd).replace('$', '\\$') + "].execute(); proc.waitFor(); println proc.in.text"
if (node == "master" || node == "built-in") {
  def proc = ['bash', '-c', cmd].execute(); proc.waitFor(); println proc.in.text
} else {
  for (slave in hudson.model.Hudson.instance.slaves) {
    if (slave.name == node) {
      println RemotingDiagnostics.executeGroovy(remote, slave.getChannel())
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct ComputerSet {
    #[serde(default)]
    computer: Vec<Computer>,
}

#[derive(Debug, Deserialize)]
struct Computer {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(default)]
    offline: bool,
}

/// Escapes text for a double-quoted Groovy string
fn groovy_string(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('\n', "\\n")
}

pub(crate) fn render_script(node: &str, command: &str) -> String {
    SCRIPT_SKELETON
        .replace("{node}", &groovy_string(node))
        .replace("{command}", &groovy_string(command))
}

impl RestBackend {
    // =============================================================================
    // Workers
    // =============================================================================

    /// Online agents, excluding the server's built-in executor
    pub(crate) async fn active_nodes(&self) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &self.config.endpoints.computers)
            .send()
            .await?;
        let set: ComputerSet = self.handle_response(response).await?;

        Ok(set
            .computer
            .into_iter()
            .filter(|c| !c.offline && !BUILT_IN_NODES.contains(&c.display_name.as_str()))
            .map(|c| c.display_name)
            .collect())
    }

    /// Runs `command` on `node` and returns what it printed
    pub(crate) async fn run_script(&self, node: &str, command: &str) -> Result<String> {
        let script = render_script(node, command);
        let response = self
            .request(Method::POST, &self.config.endpoints.script)
            .form(&[("script", script)])
            .send()
            .await?;

        self.handle_text_response(response).await
    }
}
