pub const FILE_SUMMARY_PROMPT_MD: &str = include_str!("../prompts/file_summary.md");
pub const DIRECTORY_SUMMARY_PROMPT_MD: &str = include_str!("../prompts/directory_summary.md");
pub const SYNTHESIS_PROMPT_MD: &str = include_str!("../prompts/synthesis.md");
pub const ARCHITECTURE_PROMPT_MD: &str = include_str!("../prompts/architecture.md");
pub const OVERVIEW_PROMPT_MD: &str = include_str!("../prompts/overview.md");
pub const WORKFLOW_PROMPT_MD: &str = include_str!("../prompts/workflow.md");
