//! Operator commands run from the command line instead of starting the
//! robot: secret encryption, brain maintenance and configuration checks.

use crate::base64_file::{self, BASE64_HEADER};
use crate::bot::Settings;
use crate::brain::{self, Brain, Crypt};
use crate::config::{self, Paths};

use anyhow::{Context as _, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

/// Where `dump` reads a file from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DumpSource {
    /// The stock copy under the installation directory.
    Installed,
    /// The robot's custom configuration repository.
    Configured,
}

/// The operator's brain-key cipher, from `GOPHER_ENCRYPTION_KEY`.
fn brain_crypt(paths: &Paths) -> anyhow::Result<Crypt> {
    let passphrase = std::env::var("GOPHER_ENCRYPTION_KEY")
        .ok()
        .filter(|key| !key.is_empty())
        .context("encryption not initialized: GOPHER_ENCRYPTION_KEY is not set")?;
    let operator = Crypt::from_passphrase(&passphrase)?;
    let key = brain::crypt::load_or_create_brain_key(&paths.config_dir.join(brain::crypt::KEY_FILE), &operator)?;
    Ok(Crypt::new(&key))
}

/// Input from `-f file` (`-` for stdin) or the literal argument.
fn read_input(file: Option<&Path>, literal: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match (file, literal) {
        (Some(path), _) if path == Path::new("-") => {
            let mut buffer = Vec::new();
            std::io::stdin().read_to_end(&mut buffer)?;
            Ok(buffer)
        }
        (Some(path), _) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        (None, Some(literal)) if !literal.is_empty() => Ok(literal.as_bytes().to_vec()),
        _ => bail!("ignoring zero-length item"),
    }
}

pub fn encrypt(paths: &Paths, file: Option<&Path>, binary: bool, literal: Option<&str>) -> anyhow::Result<()> {
    let crypt = brain_crypt(paths)?;
    let plain = read_input(file, literal)?;
    let sealed = crypt.encrypt(&plain)?;
    let mut stdout = std::io::stdout().lock();
    if binary {
        stdout.write_all(&sealed)?;
    } else if file.is_some() {
        stdout.write_all(base64_file::encode_wrapped(BASE64_HEADER, &sealed).as_bytes())?;
    } else {
        writeln!(stdout, "{}", STANDARD.encode(sealed))?;
    }
    Ok(())
}

pub fn decrypt(paths: &Paths, file: Option<&Path>, binary: bool, literal: Option<&str>) -> anyhow::Result<()> {
    let crypt = brain_crypt(paths)?;
    let sealed = match file {
        Some(_) => {
            let raw = read_input(file, None)?;
            base64_file::decode_wrapped(BASE64_HEADER, &raw)?
        }
        None => {
            let encoded = literal.filter(|literal| !literal.is_empty()).context("ignoring zero-length item")?;
            STANDARD.decode(encoded.trim()).context("decoding base64")?
        }
    };
    let plain = crypt.decrypt(&sealed)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&plain)?;
    if !binary && file.is_none() {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

/// Open the configured brain the way the robot would, without starting
/// anything else.
fn open_brain(paths: &Paths) -> anyhow::Result<Brain> {
    let crypt = brain_crypt(paths).ok();
    let decrypt = |value: &str| crypt.as_ref().and_then(|crypt| crypt.decrypt_string(value).ok());
    let config = config::load_robot(paths, Some(&decrypt)).context("loading robot configuration")?;
    let brain_override = std::env::var("GOPHER_BRAIN").ok();
    let settings = Settings::from_config(&config, paths, None, brain_override.as_deref());
    let backend = brain::open_backend(&settings.brain, config.brain_config.as_ref(), paths)
        .with_context(|| format!("opening brain '{}'", settings.brain))?;
    let crypt = if config.conf.encrypt_brain {
        Some(crypt.context("EncryptBrain is set but encryption is not initialized")?)
    } else {
        None
    };
    Ok(Brain::new(backend, crypt, brain::DEFAULT_LOCK_TIMEOUT))
}

pub async fn fetch(paths: &Paths, key: &str, base64: bool) -> anyhow::Result<()> {
    let brain = open_brain(paths)?;
    let datum = brain.fetch(key).await?.context("item not found")?;
    let mut stdout = std::io::stdout().lock();
    if base64 {
        writeln!(stdout, "{}", STANDARD.encode(datum))?;
    } else {
        stdout.write_all(&datum)?;
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

pub async fn store(paths: &Paths, key: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let brain = open_brain(paths)?;
    let source = file.unwrap_or(Path::new("-"));
    let blob = read_input(Some(source), None)?;
    brain.store(key, &blob).await?;
    println!("Stored");
    Ok(())
}

pub async fn delete(paths: &Paths, key: &str) -> anyhow::Result<()> {
    open_brain(paths)?.delete(key).await?;
    println!("Deleted");
    Ok(())
}

pub async fn list(paths: &Paths) -> anyhow::Result<()> {
    let keys = open_brain(paths)?.list().await?;
    if keys.is_empty() {
        println!("No memories found");
    }
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

/// Copy the protocol's answerfile template into the working directory.
pub fn init(paths: &Paths, protocol: &str) -> anyhow::Result<()> {
    let target = PathBuf::from("answerfile.txt");
    if target.exists() {
        println!("Not over-writing existing 'answerfile.txt'");
        return Ok(());
    }
    let template = paths
        .install_dir
        .join("resources")
        .join("answerfiles")
        .join(format!("{protocol}.txt"));
    let contents = std::fs::read(&template)
        .with_context(|| format!("protocol answerfile template not found: {}", template.display()))?;
    base64_file::write_private(&target, &contents)?;
    println!("Edit 'answerfile.txt' and re-run gopherbot with no arguments to generate your robot.");
    Ok(())
}

/// Template-expanded text of one configuration file, for chasing YAML
/// errors.
pub fn dump(paths: &Paths, source: DumpSource, relpath: &str) -> anyhow::Result<String> {
    let path = match source {
        DumpSource::Installed => paths.installed(relpath),
        DumpSource::Configured => paths.custom(relpath),
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading '{}'", path.display()))?;
    Ok(config::expand::expand_env(&raw, None))
}

/// Strictly decode every YAML file under `<repo>/conf`. Returns how many
/// files were checked; the error lists every failure.
pub fn validate(repo: &Path) -> anyhow::Result<usize> {
    let conf = repo.join("conf");
    let pattern = format!("{}/**/*.yaml", conf.display());
    let mut checked = 0;
    let mut failures = Vec::new();
    for entry in glob::glob(&pattern).context("invalid configuration path")? {
        let path = entry?;
        let relpath = path.strip_prefix(&conf).unwrap_or(&path).to_path_buf();
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        checked += 1;
        if let Err(error) = config::validate_text(&relpath, &text) {
            failures.push(format!("{}: {error}", relpath.display()));
        }
    }
    if !failures.is_empty() {
        bail!("{} invalid file(s):\n{}", failures.len(), failures.join("\n"));
    }
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("conf/plugins")).expect("conf dirs");
        dir
    }

    #[test]
    fn validate_reports_every_bad_file() {
        let dir = repo();
        std::fs::write(dir.path().join("conf/robot.yaml"), "Protocol: test\nAlias: ';'\n").expect("robot.yaml");
        std::fs::write(dir.path().join("conf/plugins/good.yaml"), "AllChannels: true\n").expect("good");
        std::fs::write(dir.path().join("conf/plugins/bad.yaml"), "AllChanels: true\n").expect("bad");
        std::fs::write(dir.path().join("conf/plugins/misplaced.yaml"), "Quiet: true\n").expect("misplaced");

        let error = validate(dir.path()).expect_err("two invalid files");
        let message = error.to_string();
        assert!(message.starts_with("2 invalid file(s)"));
        assert!(message.contains("plugins/bad.yaml"));
        assert!(message.contains("plugins/misplaced.yaml"));

        std::fs::remove_file(dir.path().join("conf/plugins/bad.yaml")).expect("remove");
        std::fs::remove_file(dir.path().join("conf/plugins/misplaced.yaml")).expect("remove");
        assert_eq!(validate(dir.path()).expect("valid"), 2);
    }

    #[test]
    fn dump_expands_templates() {
        let dir = repo();
        let paths = Paths::new(dir.path().to_path_buf(), dir.path().join("install"), dir.path().to_path_buf());
        std::fs::write(
            dir.path().join("conf/robot.yaml"),
            "Alias: '{{ default \";\" (env \"GOPHER_TEST_UNSET_ALIAS\") }}'\n",
        )
        .expect("robot.yaml");
        let text = dump(&paths, DumpSource::Configured, "robot.yaml").expect("dump");
        assert_eq!(text.trim(), "Alias: ';'");
        assert!(dump(&paths, DumpSource::Installed, "robot.yaml").is_err());
    }

    #[test]
    fn literal_input_must_not_be_empty() {
        assert_eq!(read_input(None, Some("secret")).expect("literal"), b"secret".to_vec());
        assert!(read_input(None, Some("")).is_err());
        assert!(read_input(None, None).is_err());
    }
}
