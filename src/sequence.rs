use serde::{Deserialize, Serialize};
use std::fmt;

/// 命令之间如何衔接
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// `&&`：任一命令失败即终止该主机剩余的命令，退出码为失败命令的退出码
    #[default]
    ShortCircuit,
    /// `;`：所有命令都会执行，退出码为最后一条命令的退出码
    Continue,
}

impl ChainMode {
    pub fn separator(&self) -> &'static str {
        match self {
            ChainMode::ShortCircuit => " && ",
            ChainMode::Continue => "; ",
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainMode::ShortCircuit => write!(f, "short_circuit"),
            ChainMode::Continue => write!(f, "continue"),
        }
    }
}

/// 在同一个远程 shell 会话中顺序执行的一组命令
///
/// 前面命令中的 `cd`、`source` 对后面的命令可见。命令内容不做校验，
/// 引号由调用方负责。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandSequence {
    commands: Vec<String>,
    #[serde(default)]
    mode: ChainMode,
}

/// 空命令链渲染出的 shell 空操作
pub const NOOP_COMMAND: &str = ":";

impl CommandSequence {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            mode: ChainMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn then(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// 渲染为一次远程调用使用的单条命令
    pub fn render(&self) -> String {
        if self.commands.is_empty() {
            return NOOP_COMMAND.to_string();
        }
        self.commands.join(self.mode.separator())
    }
}

impl<S: Into<String>> FromIterator<S> for CommandSequence {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_short_circuit() {
        let seq = CommandSequence::new(["cd /tmp", "false", "echo unreachable"]);
        assert_eq!(seq.render(), "cd /tmp && false && echo unreachable");
    }

    #[test]
    fn test_render_continue() {
        let seq = CommandSequence::new(["pkill python", "echo done"]).with_mode(ChainMode::Continue);
        assert_eq!(seq.render(), "pkill python; echo done");
    }

    #[test]
    fn test_empty_sequence_is_noop() {
        assert_eq!(CommandSequence::default().render(), NOOP_COMMAND);
    }

    #[test]
    fn test_commands_are_not_rewritten() {
        let raw = r#"sb_loc=`sudo lsblk | grep 200G | cut -f 1 -d " "`"#;
        let seq = CommandSequence::new([raw]);
        assert_eq!(seq.render(), raw);
    }

    #[test]
    fn test_builder_preserves_order() {
        let seq: CommandSequence = ["a", "b"].into_iter().collect();
        let seq = seq.then("c");
        assert_eq!(seq.commands(), &["a", "b", "c"]);
        assert_eq!(seq.len(), 3);
    }
}
