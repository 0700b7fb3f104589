mod basic_content;
mod lifecycle;
