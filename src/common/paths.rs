use std::path::PathBuf;

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/faceunlock/faceunlock.toml")
}

pub fn system_reference_dir() -> PathBuf {
    PathBuf::from("/var/lib/faceunlock/users")
}

pub fn dev_reference_dir() -> PathBuf {
    PathBuf::from("./dev_data/users")
}
