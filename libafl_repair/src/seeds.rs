//! Seed generation: ask for a generator script, run it somewhere harmless,
//! keep the files it wrote.

use core::time::Duration;
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    process::{run_captured, tail},
    proposer::{extract_block, PatchProposer},
    target::InputMode,
    Error,
};

/// Directory, relative to its working directory, the generator script writes into
pub const SCRIPT_OUTPUT_DIR: &str = "seeds";
/// Name of the single seed written when generation fails
pub const FALLBACK_SEED_NAME: &str = "seed_fallback";
const FALLBACK_SEED: &[u8] = b"A\n";

/// A generator script plus the input mode its author declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRecipe {
    /// Program that runs the script, e.g. `python3`
    pub interpreter: String,
    /// The script text
    pub script: String,
    /// How the target reads its input
    pub input_mode: InputMode,
}

/// Produces a [`SeedRecipe`] for a target
pub trait SeedGenerator {
    /// Writes a recipe for `source`, described in plain words by `description`
    fn generate(&mut self, source: &str, description: &str) -> Result<SeedRecipe, Error>;
}

/// Asks a completion endpoint for a Python generator script
#[derive(Debug)]
pub struct LlmSeedGenerator<P> {
    proposer: P,
    interpreter: String,
}

impl<P> LlmSeedGenerator<P>
where
    P: PatchProposer,
{
    /// Creates a generator whose scripts run under `interpreter`
    #[must_use]
    pub fn new(proposer: P, interpreter: &str) -> Self {
        Self {
            proposer,
            interpreter: interpreter.into(),
        }
    }

    fn prompt(source: &str, description: &str) -> String {
        format!(
            "Write a Python 3 script that creates seed inputs for fuzzing the program below.\n\
             The script must write between 1 and 20 small files into the directory `{SCRIPT_OUTPUT_DIR}/` \
             (relative to its working directory, which already exists). Use only the standard library \
             and no network access. Put the script in a single ```python code block.\n\
             After the code block, on a line of its own, state how the program reads its input: \
             `INPUT_MODE: @` if it reads standard input, or `INPUT_MODE: @@` if it reads the file \
             named by its first command-line argument.\n\n\
             Description:\n{description}\n\n\
             Program:\n```\n{source}\n```\n"
        )
    }
}

impl<P> SeedGenerator for LlmSeedGenerator<P>
where
    P: PatchProposer,
{
    fn generate(&mut self, source: &str, description: &str) -> Result<SeedRecipe, Error> {
        let response = self.proposer.propose(&Self::prompt(source, description))?;
        parse_recipe(&response, &self.interpreter)
    }
}

/// Reads the script and the `INPUT_MODE:` line out of a free-text answer
pub fn parse_recipe(response: &str, interpreter: &str) -> Result<SeedRecipe, Error> {
    let script = extract_block(response, &["python", "python3", "py"])
        .ok_or_else(|| Error::illegal_argument("Seed answer contained no script"))?;
    let mode_line = Regex::new(r"(?m)^[\s`*]*INPUT_MODE:\s*(@@|@)[\s`*]*$")?;
    let input_mode = mode_line
        .captures(response)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| Error::illegal_argument("Seed answer did not declare INPUT_MODE"))?
        .as_str()
        .parse()?;
    Ok(SeedRecipe {
        interpreter: interpreter.into(),
        script,
        input_mode,
    })
}

/// Runs `recipe` in a throwaway directory with a scrubbed environment and
/// copies what it wrote into `seeds_dir`. Returns the number of seeds.
pub fn materialize(
    recipe: &SeedRecipe,
    seeds_dir: &Path,
    timeout: Duration,
) -> Result<usize, Error> {
    let scratch = tempfile::tempdir()?;
    let script = scratch.path().join("gen_seeds");
    let out = scratch.path().join(SCRIPT_OUTPUT_DIR);
    fs::write(&script, &recipe.script)?;
    fs::create_dir_all(&out)?;

    let mut cmd = Command::new(&recipe.interpreter);
    cmd.arg(&script).current_dir(scratch.path()).env_clear();
    if let Some(path) = env::var_os("PATH") {
        cmd.env("PATH", path);
    }
    log::info!("Running seed generator under {}", recipe.interpreter);
    let captured = run_captured(&mut cmd, None, timeout)?;
    if !captured.status.success() {
        return Err(Error::illegal_state(format!(
            "Seed generator failed with {}:\n{}",
            captured.status,
            tail(captured.stderr.trim_end(), 10)
        )));
    }

    let mut produced = fs::read_dir(&out)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<PathBuf>>();
    if produced.is_empty() {
        return Err(Error::illegal_state("Seed generator wrote no files"));
    }
    produced.sort();

    reset_dir(seeds_dir)?;
    for path in &produced {
        if let Some(name) = path.file_name() {
            fs::copy(path, seeds_dir.join(name))?;
        }
    }
    log::info!("Generated {} seeds in {}", produced.len(), seeds_dir.display());
    Ok(produced.len())
}

/// Replaces the contents of `seeds_dir` with a single minimal seed
pub fn write_fallback_seed(seeds_dir: &Path) -> Result<(), Error> {
    reset_dir(seeds_dir)?;
    fs::write(seeds_dir.join(FALLBACK_SEED_NAME), FALLBACK_SEED)?;
    Ok(())
}

fn reset_dir(dir: &Path) -> Result<(), Error> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, fs, time::Duration};

    use serial_test::serial;

    use crate::{
        proposer::PatchProposer,
        seeds::{
            materialize, parse_recipe, write_fallback_seed, LlmSeedGenerator, SeedGenerator,
            SeedRecipe, FALLBACK_SEED_NAME,
        },
        target::InputMode,
        Error,
    };

    #[derive(Debug, Default)]
    struct CannedProposer {
        answers: VecDeque<String>,
        prompts: Vec<String>,
    }

    impl PatchProposer for CannedProposer {
        fn propose(&mut self, prompt: &str) -> Result<String, Error> {
            self.prompts.push(prompt.into());
            self.answers
                .pop_front()
                .ok_or_else(|| Error::transport("no more answers"))
        }
    }

    #[test]
    fn test_parse_recipe() {
        let answer = "Sure.\n```python\nopen('seeds/a', 'w').write('x')\n```\nINPUT_MODE: @@\n";
        let recipe = parse_recipe(answer, "python3").unwrap();
        assert_eq!(recipe.input_mode, InputMode::FileArg);
        assert_eq!(recipe.script, "open('seeds/a', 'w').write('x')\n");
        assert_eq!(recipe.interpreter, "python3");

        let bold = "```python\npass\n```\n**INPUT_MODE: @**";
        assert_eq!(parse_recipe(bold, "python3").unwrap().input_mode, InputMode::Stdin);
    }

    #[test]
    fn test_parse_recipe_needs_mode_and_script() {
        assert!(parse_recipe("```python\npass\n```\n", "python3").is_err());
        assert!(parse_recipe("INPUT_MODE: @\n", "python3").is_err());
        // a mention inside prose is not a declaration
        assert!(parse_recipe("```python\npass\n```\nuse INPUT_MODE: @ or so", "python3").is_err());
    }

    #[test]
    fn test_llm_generator_prompt_carries_description() {
        let mut proposer = CannedProposer::default();
        proposer
            .answers
            .push_back("```python\npass\n```\nINPUT_MODE: @\n".into());
        let mut generator = LlmSeedGenerator::new(proposer, "python3");
        let recipe = generator.generate("int main() {}", "Parses INI files").unwrap();
        assert_eq!(recipe.input_mode, InputMode::Stdin);
        assert!(generator.proposer.prompts[0].contains("Parses INI files"));
        assert!(generator.proposer.prompts[0].contains("int main() {}"));
        assert!(generator.generate("x", "y").unwrap_err().to_string().contains("Transport"));
    }

    fn sh_recipe(script: &str) -> SeedRecipe {
        SeedRecipe {
            interpreter: "sh".into(),
            script: script.into(),
            input_mode: InputMode::Stdin,
        }
    }

    #[test]
    #[serial]
    fn test_materialize_copies_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        fs::create_dir_all(&seeds).unwrap();
        fs::write(seeds.join("stale"), "old").unwrap();

        let recipe = sh_recipe("printf a > seeds/one; printf b > seeds/two\n");
        let count = materialize(&recipe, &seeds, Duration::from_secs(5)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read_to_string(seeds.join("two")).unwrap(), "b");
        assert!(!seeds.join("stale").exists());
    }

    #[test]
    #[serial]
    fn test_materialize_scrubs_environment() {
        std::env::set_var("LIBAFL_REPAIR_SEED_SECRET", "hunter2");
        let dir = tempfile::tempdir().unwrap();
        let recipe = sh_recipe("printf \"[$LIBAFL_REPAIR_SEED_SECRET]\" > seeds/env\n");
        materialize(&recipe, dir.path(), Duration::from_secs(5)).unwrap();
        std::env::remove_var("LIBAFL_REPAIR_SEED_SECRET");
        assert_eq!(fs::read_to_string(dir.path().join("env")).unwrap(), "[]");
    }

    #[test]
    #[serial]
    fn test_materialize_failures() {
        let dir = tempfile::tempdir().unwrap();
        let empty = sh_recipe("true\n");
        assert!(materialize(&empty, dir.path(), Duration::from_secs(5)).is_err());
        let broken = sh_recipe("echo nope >&2; exit 2\n");
        let err = materialize(&broken, dir.path(), Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("nope"));
        let slow = sh_recipe("sleep 10\n");
        assert!(matches!(
            materialize(&slow, dir.path(), Duration::from_millis(200)),
            Err(Error::Timeout(..))
        ));
    }

    #[test]
    fn test_fallback_seed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("junk"), "x").unwrap();
        write_fallback_seed(dir.path()).unwrap();
        let names = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![FALLBACK_SEED_NAME.to_string()]);
    }
}
