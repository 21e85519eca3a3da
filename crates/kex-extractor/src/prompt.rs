//! Prompt construction for the LLM-backed stages

/// Builds tagged prompts: a task statement, named sections, numbered rules
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    task: String,
    sections: Vec<(String, String)>,
    instructions: Vec<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            task: String::new(),
            sections: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Set the task statement
    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Add a section wrapped in `<tag>...</tag>`
    pub fn section(mut self, tag: impl Into<String>, body: impl Into<String>) -> Self {
        self.sections.push((tag.into(), body.into()));
        self
    }

    /// Add an instruction
    pub fn add_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }

    /// Build the final prompt
    pub fn build(self) -> String {
        let mut prompt = String::new();

        if !self.task.is_empty() {
            prompt.push_str("<task>\n");
            prompt.push_str(&self.task);
            prompt.push_str("\n</task>\n\n");
        }

        for (tag, body) in &self.sections {
            prompt.push_str(&format!("<{tag}>\n{body}\n</{tag}>\n\n"));
        }

        if !self.instructions.is_empty() {
            prompt.push_str("<instructions>\n");
            for (i, inst) in self.instructions.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, inst));
            }
            prompt.push_str("</instructions>\n");
        }

        prompt
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
