//! Kernel module table access through `lsmod`, `rmmod`, `insmod` and `modprobe`.

use crate::command::run_checked;
use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{CommandRunner, ModuleInspector};
use std::path::Path;

/// Module names from `lsmod` output, header skipped.
pub fn parse_lsmod(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| *name != "Module")
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct SystemModules<R> {
    runner: R,
}

impl<R> SystemModules<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R> ModuleInspector for SystemModules<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    type Error = MacvaultError;

    fn is_loaded(&self, name: &str) -> MacvaultResult<bool> {
        let output = run_checked(&self.runner, "lsmod", &[])?;
        Ok(parse_lsmod(&output.stdout).iter().any(|loaded| loaded == name))
    }

    fn remove(&self, name: &str) -> MacvaultResult<()> {
        run_checked(&self.runner, "rmmod", &[name]).map(|_| ())
    }

    fn insert(&self, path: &Path) -> MacvaultResult<()> {
        let path = path.to_string_lossy();
        run_checked(&self.runner, "insmod", &[path.as_ref()]).map(|_| ())
    }

    fn probe(&self, name: &str) -> MacvaultResult<()> {
        run_checked(&self.runner, "modprobe", &[name]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macvault_provider::CommandOutput;
    use std::cell::RefCell;

    const LSMOD: &str = "\
Module                  Size  Used by
r8169                 110592  0
realtek                36864  1
mdio_devres            12288  1 r8169
libphy                196608  3 r8169,mdio_devres,realtek
";

    struct Canned {
        output: CommandOutput,
        calls: RefCell<Vec<String>>,
    }

    impl CommandRunner for Canned {
        type Error = MacvaultError;

        fn run(&self, program: &str, args: &[&str]) -> MacvaultResult<CommandOutput> {
            let mut call = program.to_string();
            for arg in args {
                call.push(' ');
                call.push_str(arg);
            }
            self.calls.borrow_mut().push(call);
            Ok(self.output.clone())
        }
    }

    fn canned(status: i32, stdout: &str, stderr: &str) -> Canned {
        Canned {
            output: CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            calls: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn lsmod_parser_skips_header() {
        assert_eq!(
            parse_lsmod(LSMOD),
            vec!["r8169", "realtek", "mdio_devres", "libphy"]
        );
        assert!(parse_lsmod("").is_empty());
    }

    #[test]
    fn loaded_check_matches_whole_names() {
        let modules = SystemModules::new(canned(0, LSMOD, ""));
        assert!(modules.is_loaded("r8169").unwrap());
        assert!(!modules.is_loaded("r816").unwrap());
        assert!(!modules.is_loaded("pgdrv").unwrap());
    }

    #[test]
    fn insert_passes_object_path() {
        let runner = canned(0, "", "");
        let modules = SystemModules::new(runner);
        modules.insert(Path::new("rtnicpg/pgdrv.ko")).unwrap();
        assert_eq!(
            modules.runner.calls.borrow().as_slice(),
            ["insmod rtnicpg/pgdrv.ko"]
        );
    }

    #[test]
    fn failed_removal_reports_tool_output() {
        let modules = SystemModules::new(canned(1, "", "rmmod: ERROR: Module r8169 is in use"));
        let err = modules.remove("r8169").unwrap_err();
        assert!(err.to_string().contains("Module r8169 is in use"));
    }
}
