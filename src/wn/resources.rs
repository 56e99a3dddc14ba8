//! Personas, skills, and agent definitions.
//!
//! Resources are markdown files under a resource directory:
//!
//! - `personas/<name>.md` — the whole body is the system message; the
//!   identifier is the file name without extension.
//! - `skills/**/<file>.md` — YAML frontmatter delimited by `---` lines.
//!   `name` defaults to the enclosing directory, `description` is required
//!   (its absence is a validation error for that skill), `tools` is an
//!   optional inline array.  The body is everything after the closing
//!   delimiter.
//! - `agents/<name>.md` — frontmatter `name` (defaults to the file stem),
//!   `persona`, `provider`, `model`, `skills`; the body becomes the agent's
//!   description.
//!
//! Two layers combine: the global directory (`~/.wn`) is the base and the
//! project-local directory (`.wn`) overrides per entry by name — a
//! same-named local persona/skill/agent replaces the global one entirely.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::wn::error::{CoreError, CoreResult};

/// A persona: a named system message.
#[derive(Debug, Clone)]
pub struct Persona {
    /// File stem.
    pub name: String,
    /// The system message body.
    pub content: String,
}

/// A skill: a named, described prompt fragment.
#[derive(Debug, Clone)]
pub struct Skill {
    /// Frontmatter `name`, or the enclosing directory name.
    pub name: String,
    /// Required frontmatter `description`.
    pub description: String,
    /// Optional tool allowlist hint.
    pub tools: Vec<String>,
    /// Everything after the closing frontmatter delimiter.
    pub body: String,
}

/// A named sub-agent definition.
#[derive(Debug, Clone, Default)]
pub struct AgentDefinition {
    /// Frontmatter `name`, or the file stem.
    pub name: String,
    /// Persona reference.
    pub persona: Option<String>,
    /// Provider reference.
    pub provider: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Skill references.
    pub skills: Vec<String>,
    /// The markdown body.
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentFrontmatter {
    name: Option<String>,
    persona: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    #[serde(default)]
    skills: SkillsField,
}

/// `skills` accepts either a single string or an array.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum SkillsField {
    #[default]
    Empty,
    One(String),
    Many(Vec<String>),
}

impl SkillsField {
    fn into_vec(self) -> Vec<String> {
        match self {
            SkillsField::Empty => Vec::new(),
            SkillsField::One(skill) => vec![skill],
            SkillsField::Many(skills) => skills,
        }
    }
}

/// The merged persona/skill/agent tables.
#[derive(Debug, Default)]
pub struct ResourceSet {
    personas: HashMap<String, Persona>,
    skills: HashMap<String, Skill>,
    agents: HashMap<String, AgentDefinition>,
}

impl ResourceSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load global then local layers; local entries replace global ones.
    pub fn load_layered(global: Option<&Path>, local: Option<&Path>) -> CoreResult<Self> {
        let mut set = ResourceSet::new();
        if let Some(global) = global {
            set.load_dir(global)?;
        }
        if let Some(local) = local {
            set.load_dir(local)?;
        }
        Ok(set)
    }

    /// Merge one resource directory into the set, replacing by name.
    pub fn load_dir(&mut self, root: &Path) -> CoreResult<()> {
        let personas = root.join("personas");
        for path in markdown_files(&personas, false)? {
            let content = read(&path)?;
            let name = stem(&path);
            self.personas.insert(
                name.clone(),
                Persona {
                    name,
                    content: content.trim().to_string(),
                },
            );
        }

        let skills = root.join("skills");
        for path in markdown_files(&skills, true)? {
            let skill = parse_skill(&path)?;
            self.skills.insert(skill.name.clone(), skill);
        }

        let agents = root.join("agents");
        for path in markdown_files(&agents, false)? {
            let agent = parse_agent(&path)?;
            self.agents.insert(agent.name.clone(), agent);
        }

        Ok(())
    }

    /// Look a persona up by name.
    pub fn persona(&self, name: &str) -> Option<&Persona> {
        self.personas.get(name)
    }

    /// Look a skill up by name.
    pub fn skill(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// Look an agent definition up by name.
    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    /// Names of all known agent definitions.
    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    /// Insert a persona directly (used by tests and defaults).
    pub fn add_persona(&mut self, persona: Persona) {
        self.personas.insert(persona.name.clone(), persona);
    }

    /// Insert a skill directly.
    pub fn add_skill(&mut self, skill: Skill) {
        self.skills.insert(skill.name.clone(), skill);
    }

    /// Insert an agent definition directly.
    pub fn add_agent(&mut self, agent: AgentDefinition) {
        self.agents.insert(agent.name.clone(), agent);
    }
}

/// Split a markdown document into optional YAML frontmatter and the body.
///
/// Frontmatter is delimited by lines consisting of three hyphens; the first
/// line of the file must be the opening delimiter for frontmatter to exist.
pub fn split_frontmatter(text: &str) -> (Option<String>, String) {
    let mut lines = text.lines();
    match lines.next() {
        Some(first) if first.trim() == "---" => {}
        _ => return (None, text.to_string()),
    }

    let mut frontmatter = Vec::new();
    for line in lines.by_ref() {
        if line.trim() == "---" {
            let body: Vec<&str> = lines.collect();
            return (Some(frontmatter.join("\n")), body.join("\n"));
        }
        frontmatter.push(line);
    }
    // No closing delimiter: treat the whole document as body.
    (None, text.to_string())
}

fn parse_skill(path: &Path) -> CoreResult<Skill> {
    let text = read(path)?;
    let (frontmatter, body) = split_frontmatter(&text);
    let meta: SkillFrontmatter = match frontmatter {
        Some(yaml) => serde_yaml::from_str(&yaml).map_err(|e| {
            CoreError::Config(format!("invalid skill frontmatter {}: {}", path.display(), e))
        })?,
        None => SkillFrontmatter::default(),
    };

    let description = meta.description.ok_or_else(|| {
        CoreError::Config(format!(
            "skill {} is missing the required 'description' field",
            path.display()
        ))
    })?;

    let name = meta.name.unwrap_or_else(|| enclosing_dir(path));
    Ok(Skill {
        name,
        description,
        tools: meta.tools,
        body: body.trim().to_string(),
    })
}

fn parse_agent(path: &Path) -> CoreResult<AgentDefinition> {
    let text = read(path)?;
    let (frontmatter, body) = split_frontmatter(&text);
    let meta: AgentFrontmatter = match frontmatter {
        Some(yaml) => serde_yaml::from_str(&yaml).map_err(|e| {
            CoreError::Config(format!("invalid agent frontmatter {}: {}", path.display(), e))
        })?,
        None => AgentFrontmatter::default(),
    };

    Ok(AgentDefinition {
        name: meta.name.unwrap_or_else(|| stem(path)),
        persona: meta.persona,
        provider: meta.provider,
        model: meta.model,
        skills: meta.skills.into_vec(),
        description: body.trim().to_string(),
    })
}

fn read(path: &Path) -> CoreResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("cannot read {}: {}", path.display(), e)))
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn enclosing_dir(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| stem(path))
}

/// Collect `.md` files under `dir`, optionally recursing.
fn markdown_files(dir: &Path, recursive: bool) -> CoreResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {}", current.display(), e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if path.extension().map(|e| e == "md").unwrap_or(false) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}
