/*!
 * 子进程白名单门禁
 *
 * 白名单启用时：含路径分隔符的命令一律拒绝，basename 不在名单内拒绝。
 * 在 spawn 之前检查。
 */

use crate::error::{CoreError, CoreResult};

/// 检查命令是否允许 spawn
pub fn check_command_allowed(program: &str, allowlist: Option<&[String]>) -> CoreResult<()> {
    let Some(allowlist) = allowlist else {
        return Ok(());
    };

    if program.contains('/') || program.contains('\\') {
        return Err(CoreError::validation(format!(
            "白名单启用时不允许带路径的命令: {}",
            program
        )));
    }

    if !allowlist.iter().any(|allowed| allowed == program) {
        return Err(CoreError::validation(format!(
            "命令不在白名单内: {}",
            program
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_allowlist_allows_everything() {
        assert!(check_command_allowed("droid", None).is_ok());
        assert!(check_command_allowed("/usr/local/bin/droid", None).is_ok());
    }

    #[test]
    fn test_basename_membership() {
        let allowlist = list(&["droid", "gemini"]);
        assert!(check_command_allowed("droid", Some(&allowlist)).is_ok());
        assert!(check_command_allowed("amp", Some(&allowlist)).is_err());
    }

    #[test]
    fn test_path_separator_rejected_when_active() {
        let allowlist = list(&["droid"]);
        assert!(check_command_allowed("/usr/bin/droid", Some(&allowlist)).is_err());
        assert!(check_command_allowed("bin\\droid.exe", Some(&allowlist)).is_err());
    }
}
