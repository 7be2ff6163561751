//! Fixed paths/commands shared between the PTY Broker (idempotent scaffold
//! creation, §4.7 step 5) and the Run Coordinator (command injection,
//! §4.9 step 5) so both agree on where the per-instance language runtime
//! lives without either hard-coding the other's concern.

/// Fixed path of the per-instance Python virtual environment.
pub const VENV_PATH: &str = "/home/user/venv";

/// The interpreter the Run Coordinator invokes the entry file with.
pub fn python_bin() -> String {
    format!("{VENV_PATH}/bin/python3")
}

/// Idempotent: creates the venv only if it isn't already there. A short
/// `Exec`, never an `Attach` (§4.7 step 5 — this must not consume the PTY).
pub fn ensure_scaffold_argv() -> Vec<String> {
    vec![
        "bash".into(),
        "-c".into(),
        format!("test -x {}/bin/python3 || python3 -m venv {VENV_PATH}", VENV_PATH),
    ]
}

/// Shell prompt shown once the scaffold is activated, so the user recognizes
/// a freshly attached shell (§4.7 step 6).
pub fn shell_argv() -> Vec<String> {
    vec![
        "bash".into(),
        "--rcfile".into(),
        "/dev/null".into(),
        "-i".into(),
        "-c".into(),
        format!(
            "source {VENV_PATH}/bin/activate && export PS1='(workbench) \\w $ ' && exec bash --norc -i"
        ),
    ]
}
