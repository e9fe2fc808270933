//! Typed invocation of external scripts.
//!
//! A stage script is described by a value implementing [`ScriptArgs`]; the
//! spawner only asks it for arguments, environment and file name and
//! resolves the path against the scripts directory itself.

/// What a spawner needs to know to run one script.
///
/// Stage scripts take no arguments and read everything from `OSI_*`
/// variables, see [`crate::stage_env`].
pub trait ScriptArgs {
    /// Command line arguments after the script path.
    fn to_cli_args(&self) -> Vec<String>;

    /// Environment variables added to the inherited environment.
    fn get_env_vars(&self) -> Vec<(String, String)>;

    /// File name of the script, e.g. `install.sh`.
    fn script_name(&self) -> &'static str;
}
