use crate::protocol::packet::to_clt::{Media, MediaAnnouncement, MediaFile};
use ahash::AHashMap;
use bytes::Bytes;

/// Soft size limit of one `Media` bunch.
const BUNCH_SIZE: usize = 64 * 1024;

/// Media files merged across backends by name.
#[derive(Debug, Default)]
pub struct MediaStore {
    files: AHashMap<String, Bytes>,
    announcements: Vec<MediaAnnouncement>,
}

impl MediaStore {
    /// Adds the files of one backend. Returns the names that were already
    /// present; the stored copy stays.
    pub fn merge(
        &mut self,
        announcements: &[MediaAnnouncement],
        files: &[MediaFile],
    ) -> Vec<String> {
        let mut duplicates = Vec::new();
        for announcement in announcements {
            if self.files.contains_key(&announcement.name) {
                duplicates.push(announcement.name.clone());
                continue;
            }
            let Some(file) = files.iter().find(|f| f.name == announcement.name) else {
                continue;
            };
            self.files.insert(file.name.clone(), file.data.clone());
            self.announcements.push(announcement.clone());
        }
        duplicates
    }

    pub fn announcements(&self) -> &[MediaAnnouncement] {
        &self.announcements
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.files.get(name)
    }

    /// Packs the requested files into bunches. Unknown names are skipped.
    pub fn bunches(&self, names: &[String]) -> Vec<Media> {
        let mut groups: Vec<Vec<MediaFile>> = vec![Vec::new()];
        let mut size = 0;
        for name in names {
            let Some(data) = self.files.get(name) else {
                tracing::debug!(%name, "client requested unknown media");
                continue;
            };
            if size > 0 && size + data.len() > BUNCH_SIZE {
                groups.push(Vec::new());
                size = 0;
            }
            size += data.len();
            if let Some(group) = groups.last_mut() {
                group.push(MediaFile {
                    name: name.clone(),
                    data: data.clone(),
                });
            }
        }

        let bunch_count = groups.len() as u16;
        groups
            .into_iter()
            .enumerate()
            .map(|(index, files)| Media {
                bunch_count,
                bunch_index: index as u16,
                files,
            })
            .collect()
    }
}
