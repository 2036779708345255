use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Inline content above this size is replaced by a file pointer in the
/// prompt, and the model is told to read the file on demand.
const INLINE_THRESHOLD: usize = 2000;

#[derive(Debug, Clone)]
pub enum SkillContent {
    Inline(String),
    FileRef(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Always-on skills get their full body injected into every
    /// system prompt, regardless of size.
    pub always_include: bool,
    pub content: SkillContent,
}

/// Loads skills from `<skills_dir>/<name>/SKILL.md`. Each file starts
/// with a `---` frontmatter block of `key: value` lines; the rest is
/// the skill body handed to the model.
pub struct SkillsLoader {
    dir: PathBuf,
}

struct Frontmatter {
    description: String,
    always: bool,
    requires: Vec<String>,
}

impl SkillsLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn list(&self) -> Vec<Skill> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let skill_file = path.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }
            match self.load_one(name, &skill_file) {
                Ok(Some(skill)) => skills.push(skill),
                Ok(None) => {
                    debug!(skill = name, "skipping skill with unmet requirements");
                }
                Err(e) => {
                    warn!(skill = name, error = %e, "failed to load skill");
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    fn load_one(&self, name: &str, path: &Path) -> std::io::Result<Option<Skill>> {
        let raw = std::fs::read_to_string(path)?;
        let (front, body) = split_frontmatter(&raw);
        let front = parse_frontmatter(front);

        for requirement in &front.requires {
            if !requirement_met(requirement) {
                return Ok(None);
            }
        }

        let body = body.trim();
        let content = if front.always || body.len() <= INLINE_THRESHOLD {
            SkillContent::Inline(body.to_string())
        } else {
            SkillContent::FileRef(path.to_path_buf())
        };

        Ok(Some(Skill {
            name: name.to_string(),
            description: front.description,
            always_include: front.always,
            content,
        }))
    }

    /// Renders the skills portion of a system prompt: always-on skill
    /// bodies verbatim, then a catalog of the rest the model can pull
    /// in by reading the referenced file.
    pub fn prompt_section(&self) -> String {
        let skills = self.list();
        if skills.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        for skill in skills.iter().filter(|s| s.always_include) {
            if let SkillContent::Inline(body) = &skill.content {
                out.push_str(body);
                out.push_str("\n\n");
            }
        }

        let on_demand: Vec<&Skill> = skills.iter().filter(|s| !s.always_include).collect();
        if !on_demand.is_empty() {
            out.push_str("<skills>\n");
            for skill in on_demand {
                match &skill.content {
                    SkillContent::Inline(body) => {
                        out.push_str(&format!(
                            "<skill name=\"{}\" description=\"{}\">\n{}\n</skill>\n",
                            xml_escape(&skill.name),
                            xml_escape(&skill.description),
                            body
                        ));
                    }
                    SkillContent::FileRef(path) => {
                        out.push_str(&format!(
                            "<skill name=\"{}\" description=\"{}\" file=\"{}\"/>\n",
                            xml_escape(&skill.name),
                            xml_escape(&skill.description),
                            path.display()
                        ));
                    }
                }
            }
            out.push_str("</skills>\n");
        }
        out
    }
}

fn split_frontmatter(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim_start();
    if let Some(rest) = trimmed.strip_prefix("---")
        && let Some(end) = rest.find("\n---")
    {
        let front = &rest[..end];
        let body = rest[end + 4..].trim_start_matches(['-']).trim_start();
        return (front, body);
    }
    ("", raw)
}

fn parse_frontmatter(front: &str) -> Frontmatter {
    let mut description = String::new();
    let mut always = false;
    let mut requires = Vec::new();
    for line in front.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "description" => description = value.to_string(),
            "always" => always = value.eq_ignore_ascii_case("true"),
            "requires" => {
                requires = value
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
    Frontmatter {
        description,
        always,
        requires,
    }
}

/// `env:VAR` requires the variable to be set; anything else is a
/// binary that must be on PATH.
fn requirement_met(requirement: &str) -> bool {
    if let Some(var) = requirement.strip_prefix("env:") {
        return std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
    }
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':')
        .any(|dir| Path::new(dir).join(requirement).is_file())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(dir: &TempDir, name: &str, content: &str) {
        let skill_dir = dir.path().join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn parses_frontmatter_and_body() {
        let dir = TempDir::new().unwrap();
        write_skill(
            &dir,
            "greeting",
            "---\ndescription: how to greet users\nalways: false\n---\nAlways say hello politely.",
        );

        let loader = SkillsLoader::new(dir.path().to_path_buf());
        let skills = loader.list();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "greeting");
        assert_eq!(skills[0].description, "how to greet users");
        assert!(!skills[0].always_include);
        match &skills[0].content {
            SkillContent::Inline(body) => assert_eq!(body, "Always say hello politely."),
            other => panic!("expected inline content, got {:?}", other),
        }
    }

    #[test]
    fn large_bodies_become_file_refs() {
        let dir = TempDir::new().unwrap();
        let body = "x".repeat(INLINE_THRESHOLD + 1);
        write_skill(
            &dir,
            "big",
            &format!("---\ndescription: big one\n---\n{}", body),
        );

        let loader = SkillsLoader::new(dir.path().to_path_buf());
        let skills = loader.list();
        assert!(matches!(skills[0].content, SkillContent::FileRef(_)));

        let section = loader.prompt_section();
        assert!(section.contains("file=\""));
        assert!(!section.contains(&body));
    }

    #[test]
    fn always_skills_stay_inline_regardless_of_size() {
        let dir = TempDir::new().unwrap();
        let body = "y".repeat(INLINE_THRESHOLD + 1);
        write_skill(
            &dir,
            "core-rules",
            &format!("---\ndescription: rules\nalways: true\n---\n{}", body),
        );

        let loader = SkillsLoader::new(dir.path().to_path_buf());
        let skills = loader.list();
        assert!(skills[0].always_include);
        assert!(matches!(skills[0].content, SkillContent::Inline(_)));

        let section = loader.prompt_section();
        assert!(section.contains(&body));
        assert!(!section.contains("<skills>"));
    }

    #[test]
    fn unmet_requirements_hide_the_skill() {
        let dir = TempDir::new().unwrap();
        write_skill(
            &dir,
            "needs-tool",
            "---\ndescription: needs something exotic\nrequires: definitely-not-a-real-binary-9c4\n---\nbody",
        );
        write_skill(
            &dir,
            "needs-env",
            "---\ndescription: needs a var\nrequires: env:RUNA_TEST_UNSET_VAR_9C4\n---\nbody",
        );

        let loader = SkillsLoader::new(dir.path().to_path_buf());
        assert!(loader.list().is_empty());
    }

    #[test]
    fn missing_dir_is_empty_not_an_error() {
        let loader = SkillsLoader::new(PathBuf::from("/nonexistent/skills"));
        assert!(loader.list().is_empty());
        assert_eq!(loader.prompt_section(), "");
    }

    #[test]
    fn escapes_xml_in_catalog() {
        let dir = TempDir::new().unwrap();
        write_skill(
            &dir,
            "tricky",
            "---\ndescription: a <b> & \"c\"\n---\nbody",
        );
        let loader = SkillsLoader::new(dir.path().to_path_buf());
        let section = loader.prompt_section();
        assert!(section.contains("&lt;b&gt; &amp; &quot;c&quot;"));
    }
}
