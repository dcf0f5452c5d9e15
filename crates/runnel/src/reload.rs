//! Scripts that re-import watched modules before a run.

use serde_json::Value;

const HEADER: &str = "# runnel: reload watched modules";

/// Build the reload script for `modules`, in the given order.
///
/// Every name already present in the interpreter's module registry is
/// re-imported. Modules that were never imported are skipped. The helper
/// bindings are deleted at the end so they do not leak into user code.
pub fn reload_script<I, S>(modules: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut script = format!(
        "{HEADER}\nimport importlib as _runnel_importlib\nimport sys as _runnel_sys\n"
    );
    for name in modules {
        let literal = Value::from(name.as_ref()).to_string();
        script.push_str(&format!(
            "if {literal} in _runnel_sys.modules:\n    \
             _runnel_importlib.reload(_runnel_sys.modules[{literal}])\n"
        ));
    }
    script.push_str("del _runnel_importlib\ndel _runnel_sys\n");
    script
}

/// Recover the module names from a script built by [`reload_script`].
pub fn parse(script: &str) -> Option<Vec<String>> {
    let body = script.strip_prefix(HEADER)?;
    body.lines()
        .filter_map(|line| line.strip_prefix("if ")?.strip_suffix(" in _runnel_sys.modules:"))
        .map(|literal| serde_json::from_str(literal).ok())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_script_reloads_each_module_in_order() {
        let script = reload_script(["helpers", "pkg.util"]);

        let helpers = script.find(r#"_runnel_sys.modules["helpers"]"#).unwrap();
        let util = script.find(r#"_runnel_sys.modules["pkg.util"]"#).unwrap();
        assert!(helpers < util);
        assert!(script.ends_with("del _runnel_importlib\ndel _runnel_sys\n"));
    }

    #[test]
    fn test_empty_set_only_imports_and_cleans_up() {
        let script = reload_script(Vec::<String>::new());
        assert!(!script.contains("if "));
        assert_eq!(parse(&script).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_parse_round_trips_awkward_names() {
        let names = ["plain", r#"quo"te"#, r"back\slash"];
        assert_eq!(parse(&reload_script(names)).unwrap(), names);
    }

    #[test]
    fn test_parse_rejects_other_sources() {
        assert_eq!(parse("print(1)"), None);
    }
}
