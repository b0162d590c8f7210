use anyhow::Context;
use provision_core::{config::Config, io, paths};
use std::path::Path;

const SAMPLE_PLAN_NAME: &str = "ai-stack";

/// Ollama on the host, Open WebUI in Docker, GPU runtime when available.
const SAMPLE_PLAN: &str = r#"name: ai-stack
description: Local model runtime (Ollama) with Open WebUI in Docker
backup:
  paths:
    - /etc/systemd/system/ollama.service.d
steps:
  - id: install_prereqs
    category: system
    description: Base packages
    action: { type: shell, command: "apt-get update && apt-get install -y curl ca-certificates", attempts: 3, backoff_ms: 2000 }
  - id: install_docker
    category: docker
    depends_on: [install_prereqs]
    action: { type: shell, command: "command -v docker || (curl -fsSL https://get.docker.com | sh)", timeout_seconds: 900 }
  - id: install_nvidia_toolkit
    category: docker
    depends_on: [install_docker]
    requirements: { gpu: true }
    action: { type: shell, command: "apt-get install -y nvidia-container-toolkit && nvidia-ctk runtime configure --runtime=docker && systemctl restart docker" }
  - id: install_ollama
    category: ollama
    depends_on: [install_prereqs]
    action: { type: shell, command: "command -v ollama || (curl -fsSL https://ollama.com/install.sh | sh)", timeout_seconds: 900 }
  - id: ollama_override
    category: ollama
    depends_on: [install_ollama]
    action:
      type: write_file
      path: /etc/systemd/system/ollama.service.d/override.conf
      contents: |
        [Service]
        Environment="OLLAMA_HOST=0.0.0.0"
      mode: "0644"
    undo: { type: shell, command: "rm -f /etc/systemd/system/ollama.service.d/override.conf && systemctl daemon-reload" }
  - id: restart_ollama
    category: ollama
    depends_on: [ollama_override]
    idempotent: false
    action: { type: shell, command: "systemctl daemon-reload && systemctl enable --now ollama && systemctl restart ollama" }
  - id: ollama_active
    category: ollama
    depends_on: [restart_ollama]
    action: { type: service_active, service: ollama, timeout_seconds: 60 }
  - id: ollama_ready
    category: ollama
    depends_on: [ollama_active]
    action: { type: http_ready, url: "http://127.0.0.1:11434/api/tags" }
  - id: webui_data
    category: webui
    action: { type: ensure_dir, path: /opt/open-webui/data, mode: "0755" }
  - id: run_webui
    category: webui
    depends_on: [install_docker, webui_data, ollama_ready]
    action: { type: shell, command: "docker rm -f open-webui 2>/dev/null; docker run -d --name open-webui --restart unless-stopped -p 3000:8080 --add-host=host.docker.internal:host-gateway -v /opt/open-webui/data:/app/backend/data -e OLLAMA_BASE_URL=http://host.docker.internal:11434 ghcr.io/open-webui/open-webui:main" }
    undo: { type: shell, command: "docker rm -f open-webui" }
  - id: webui_ready
    category: webui
    depends_on: [run_webui]
    action: { type: http_ready, url: "http://127.0.0.1:3000", timeout_seconds: 180, poll_interval_ms: 5000 }
checks:
  - category: system
    check: { type: memory, min_mb: 8192 }
  - category: docker
    check: { type: command, program: docker }
  - category: ollama
    check: { type: service, name: ollama }
  - category: ollama
    check: { type: endpoint, url: "http://127.0.0.1:11434/api/tags" }
  - category: webui
    check: { type: directory, path: /opt/open-webui/data }
  - category: webui
    check: { type: endpoint, url: "http://127.0.0.1:3000" }
  - category: gpu
    check: { type: gpu }
"#;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing provisioning in: {}", root.display());

    for dir in [
        paths::PROVISION_DIR,
        paths::PLANS_DIR,
        paths::RUNS_DIR,
        paths::BACKUPS_DIR,
    ] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let plan_path = paths::plan_path(root, SAMPLE_PLAN_NAME);
    let shown = plan_path.strip_prefix(root).unwrap_or(plan_path.as_path()).display();
    if io::write_if_missing(&plan_path, SAMPLE_PLAN.as_bytes())
        .with_context(|| format!("failed to write {}", plan_path.display()))?
    {
        println!("  created: {shown}");
    } else {
        println!("  exists:  {shown}");
    }

    println!("\nNext: provision plan show {SAMPLE_PLAN_NAME}");
    Ok(())
}
