#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "scenario",
        action: "set_scenario",
    },
    CommandSpec {
        command: "background",
        action: "set_background",
    },
    CommandSpec {
        command: "analyze",
        action: "analyze_text",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "file",
    action: "analyze_file",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "scenarios",
        action: "list_scenarios",
    },
    CommandSpec {
        command: "report",
        action: "show_report",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/scenarios",
    "/scenario",
    "/background",
    "/analyze",
    "/file",
    "/report",
    "/reset",
    "/help",
    "/quit",
];
