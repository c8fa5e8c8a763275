//! Holding-page templating (spec.md §4.2, §6, §9): served while a backend
//! transitions from stopped to ready.

const DEFAULT_TEMPLATE: &str = include_str!("holding_page.html");

#[derive(Clone)]
pub struct HoldingPage {
    template: String,
}

impl HoldingPage {
    pub fn default_template() -> Self {
        HoldingPage {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    pub async fn load(path: &std::path::Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(template) => HoldingPage { template },
            Err(_) => Self::default_template(),
        }
    }

    /// Replaces *all* occurrences of both placeholders, per spec.md §6
    /// ("implementations should replace all").
    pub fn render(&self, host: &str, path: &str, container_name: &str) -> String {
        let redirect_url = format!("https://{path}.{host}");
        self.template
            .replace("{{REDIRECT_URL}}", &redirect_url)
            .replace("{{CONTAINER_NAME}}", container_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_every_occurrence() {
        let page = HoldingPage {
            template: "{{CONTAINER_NAME}} is starting, go to {{REDIRECT_URL}} ({{CONTAINER_NAME}})"
                .to_string(),
        };
        let rendered = page.render("example.com", "app", "app-1");
        assert_eq!(
            rendered,
            "app-1 is starting, go to https://app.example.com (app-1)"
        );
    }
}
