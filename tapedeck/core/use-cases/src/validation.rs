use ::domain::DownloadRequest;

use crate::errors::DownloadError;
use crate::models::descriptors::ToolchainProfile;

static VIDEO_URL: ::once_cell::sync::Lazy<::regex::Regex> = ::once_cell::sync::Lazy::new(|| {
    ::regex::Regex::new(r"^(?i:https?)://[^\s/?#:@]+\.[^\s/?#:@]+(?::\d+)?(?:[/?#]\S*)?$").unwrap()
});

/// Checks the request. The only thing written is a throwaway file proving the
/// destination directory accepts new files.
pub fn validate(request: &DownloadRequest) -> Result<(), DownloadError> {
    let url = request.url.trim();

    if url.is_empty() {
        return Err(DownloadError::Validation("the URL is empty".into()));
    }

    if !VIDEO_URL.is_match(url) {
        return Err(DownloadError::Validation(format!("`{}` does not look like a video URL", url).into()));
    }

    let destination = &*request.destination;

    if destination.file_name().is_none() {
        return Err(DownloadError::Validation(
            format!("`{}` does not name a file", destination.display()).into(),
        ));
    }

    // The session writes the profile's extension, not necessarily the one asked for.
    let final_path = ToolchainProfile::resolve(request.format).final_path(destination);

    for path in [destination, final_path.as_path()] {
        if path.is_dir() {
            return Err(DownloadError::Validation(format!("`{}` is a directory", path.display()).into()));
        }
    }

    let directory = match final_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => ::std::path::Path::new("."),
    };

    let metadata = ::std::fs::metadata(directory).map_err(|err| {
        DownloadError::Validation(format!("cannot use directory `{}`: {}", directory.display(), err).into())
    })?;

    if !metadata.is_dir() {
        return Err(DownloadError::Validation(
            format!("`{}` is not a directory", directory.display()).into(),
        ));
    }

    // Mode bits alone say nothing about who owns the directory.
    ::tempfile::tempfile_in(directory).map_err(|err| {
        DownloadError::Validation(format!("directory `{}` is not writable: {}", directory.display(), err).into())
    })?;

    Ok(())
}
