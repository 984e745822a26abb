pub mod aliases {
    pub type Fallible<T> = ::anyhow::Result<T>;
}

pub mod extensions {
    use crate::utils::aliases::Fallible;

    pub trait OptionExt<T> {
        fn ok(self) -> Fallible<T>;
    }

    impl<T> OptionExt<T> for Option<T> {
        #[track_caller]
        fn ok(self) -> Fallible<T> {
            match self {
                Some(val) => Ok(val),
                None => {
                    let location = ::std::panic::Location::caller();
                    Err(::anyhow::anyhow!(
                        "called `OptionExt::ok()` on a `None` value at {}:{}:{}",
                        location.file(),
                        location.line(),
                        location.column()
                    ))
                },
            }
        }
    }
}

pub mod naming {
    use ::domain::MediaFormat;
    use ::use_cases::models::descriptors::ToolchainProfile;

    /// File name offered when no destination was given: the video id when the
    /// URL carries one, else its last path segment.
    pub fn suggested_file_name(url: &str, format: MediaFormat) -> ::std::path::PathBuf {
        let (address, query) = match url.split('#').next().unwrap_or_default().split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (url.split('#').next().unwrap_or_default(), None),
        };

        let video_id = query.and_then(|query| query.split('&').find_map(|pair| pair.strip_prefix("v=")));

        let last_segment = address
            .split_once("://")
            .map_or(address, |(_, rest)| rest)
            .split_once('/')
            .and_then(|(_, path)| path.rsplit('/').find(|segment| !segment.is_empty()));

        let stem = video_id
            .or(last_segment)
            .map(|stem| {
                stem.chars()
                    .filter(|&character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
                    .collect::<String>()
            })
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "download".to_owned());

        ::std::path::PathBuf::from(stem).with_extension(ToolchainProfile::resolve(format).extension)
    }

}
